use std::collections::HashSet;

use rand::Rng;

use crate::{ComparisonPair, Item, RankerError, ScoreStore, UserScore};

/// Choose the next pair of items `user` should compare.
///
/// Reads the item population and the user's scores from `store`; never writes.
///
/// # Errors
/// Returns [`RankerError::InsufficientItems`] when fewer than two items exist, or
/// [`RankerError::Store`] when the population or the user's scores cannot be read.
pub fn select_pair_for_user<S, R>(
    store: &S,
    user: &str,
    rng: &mut R,
) -> Result<ComparisonPair, RankerError>
where
    S: ScoreStore + ?Sized,
    R: Rng + ?Sized,
{
    let items = store.list_items()?;
    if items.len() < 2 {
        return Err(RankerError::InsufficientItems { found: items.len() });
    }
    let user_scores = store.get_user_scores_for_user(user)?;
    let pair = select_pair(&items, &user_scores, rng)?;
    tracing::info!(user, pair = %pair, "selected comparison pair");
    Ok(pair)
}

/// Selection policy over an already loaded population.
///
/// Items the user has never scored come first, in listing order. Once fewer than two
/// remain, partners are drawn uniformly from the items with the fewest votes.
///
/// # Errors
/// Returns [`RankerError::InsufficientItems`] when fewer than two items are available.
pub fn select_pair<R>(
    items: &[Item],
    user_scores: &[UserScore],
    rng: &mut R,
) -> Result<ComparisonPair, RankerError>
where
    R: Rng + ?Sized,
{
    if items.len() < 2 {
        return Err(RankerError::InsufficientItems { found: items.len() });
    }

    let population: HashSet<&str> = items.iter().map(|item| item.name.as_str()).collect();
    let scored: HashSet<&str> =
        user_scores.iter().map(|score| score.item_name.as_str()).collect();

    let unranked: Vec<&str> = items
        .iter()
        .map(|item| item.name.as_str())
        .filter(|name| !scored.contains(name))
        .collect();
    // Scores for items that have since been deleted are never offered.
    let rated: Vec<&UserScore> = user_scores
        .iter()
        .filter(|score| population.contains(score.item_name.as_str()))
        .collect();

    let pair = match unranked.as_slice() {
        [first, second, ..] => Some(make_pair(first, second)),
        [only] => pair_with_fewest_voted(only, &rated, rng),
        [] => pair_from_fewest_voted(&rated, rng),
    };

    pair.ok_or(RankerError::InsufficientItems { found: unranked.len() + rated.len() })
}

fn make_pair(item1: &str, item2: &str) -> ComparisonPair {
    ComparisonPair { item1: item1.to_string(), item2: item2.to_string() }
}

/// Names of the scored items tied for the fewest votes, skipping `exclude`.
fn fewest_voted<'a>(scores: &[&'a UserScore], exclude: Option<&str>) -> Vec<&'a str> {
    let eligible: Vec<&'a UserScore> = scores
        .iter()
        .copied()
        .filter(|score| Some(score.item_name.as_str()) != exclude)
        .collect();
    let Some(min_votes) = eligible.iter().map(|score| score.num_votes).min() else {
        return Vec::new();
    };
    eligible
        .into_iter()
        .filter(|score| score.num_votes == min_votes)
        .map(|score| score.item_name.as_str())
        .collect()
}

fn pair_with_fewest_voted<R>(
    fixed: &str,
    scores: &[&UserScore],
    rng: &mut R,
) -> Option<ComparisonPair>
where
    R: Rng + ?Sized,
{
    let tier = fewest_voted(scores, Some(fixed));
    if tier.is_empty() {
        return None;
    }
    let partner = tier[rng.gen_range(0..tier.len())];
    Some(make_pair(fixed, partner))
}

fn pair_from_fewest_voted<R>(scores: &[&UserScore], rng: &mut R) -> Option<ComparisonPair>
where
    R: Rng + ?Sized,
{
    let tier = fewest_voted(scores, None);
    match tier.len() {
        0 => None,
        1 => pair_with_fewest_voted(tier[0], scores, rng),
        len => {
            let first = rng.gen_range(0..len);
            let mut second = rng.gen_range(0..len - 1);
            if second >= first {
                second += 1;
            }
            Some(make_pair(tier[first], tier[second]))
        }
    }
}

use std::fmt::{Display, Formatter};

use crate::{GlobalScore, RankerError, ScoreStore, Standing, StoreError, UserScore, Vote};

/// Rating given to an item the first time it is compared in a ladder.
pub const DEFAULT_RATING: i64 = 1000;

/// Maximum rating points exchanged in one comparison.
pub const ELO_K: f64 = 64.0;

/// Which Elo ladder a score belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    User(&'a str),
    Global,
}

impl Display for Scope<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(user) => write!(f, "user:{user}"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// Probability that an item rated `rating` beats one rated `opponent`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn expected_score(rating: i64, opponent: i64) -> f64 {
    1.0 / (1.0 + 10_f64.powf((opponent - rating) as f64 / 400.0))
}

/// New ratings for both sides of one comparison.
///
/// Each side's expectation is computed on its own rather than as the complement of the
/// other, and the point change is truncated toward zero.
#[must_use]
pub fn compute_score_changes(rating1: i64, rating2: i64, item1_won: bool) -> (i64, i64) {
    let expected1 = expected_score(rating1, rating2);
    let expected2 = expected_score(rating2, rating1);
    let (outcome1, outcome2) = if item1_won { (1.0, 0.0) } else { (0.0, 1.0) };
    (rating1 + rating_change(outcome1, expected1), rating2 + rating_change(outcome2, expected2))
}

#[allow(clippy::cast_possible_truncation)]
fn rating_change(outcome: f64, expected: f64) -> i64 {
    (ELO_K * (outcome - expected)) as i64
}

/// Read the standing of `item` in `scope`, creating the record with `default` first if it
/// does not exist yet.
///
/// # Errors
/// Returns [`StoreError`] when the read fails or the default record cannot be written.
pub fn get_or_default<S>(
    store: &mut S,
    scope: Scope<'_>,
    item: &str,
    default: Standing,
) -> Result<Standing, StoreError>
where
    S: ScoreStore + ?Sized,
{
    match scope {
        Scope::User(user) => {
            if let Some(score) = store.get_user_score(item, user)? {
                return Ok(score.standing());
            }
            store.put_user_score(&UserScore::new(item, user, default))?;
        }
        Scope::Global => {
            if let Some(score) = store.get_global_score(item)? {
                return Ok(score.standing());
            }
            store.put_global_score(&GlobalScore::new(item, default))?;
        }
    }
    tracing::debug!(scope = %scope, item, rating = default.rating, "created score record");
    Ok(default)
}

fn write_standing<S>(
    store: &mut S,
    scope: Scope<'_>,
    item: &str,
    standing: Standing,
) -> Result<(), StoreError>
where
    S: ScoreStore + ?Sized,
{
    match scope {
        Scope::User(user) => store.update_user_score(&UserScore::new(item, user, standing)),
        Scope::Global => store.update_global_score(&GlobalScore::new(item, standing)),
    }
}

/// Apply `user`'s vote to the user's own ladder and to the global ladder.
///
/// Writes are not transactional: every update is attempted, the first failure is
/// returned, and updates that already landed stay in place.
///
/// # Errors
/// Returns [`RankerError::InvalidChoice`] before touching the store when the vote is
/// malformed, or [`RankerError::Store`] when a read or write fails.
pub fn process_vote<S>(store: &mut S, user: &str, vote: &Vote) -> Result<(), RankerError>
where
    S: ScoreStore + ?Sized,
{
    vote.validate()?;
    let item1_won = vote.item1_won();

    let mut updates = Vec::with_capacity(4);
    for scope in [Scope::User(user), Scope::Global] {
        let mut first = get_or_default(store, scope, &vote.item1, Standing::initial())?;
        let mut second = get_or_default(store, scope, &vote.item2, Standing::initial())?;
        first.num_votes += 1;
        second.num_votes += 1;
        (first.rating, second.rating) =
            compute_score_changes(first.rating, second.rating, item1_won);
        updates.push((scope, vote.item1.as_str(), first));
        updates.push((scope, vote.item2.as_str(), second));
    }

    let mut first_failure = None;
    for (scope, item, standing) in updates {
        if let Err(err) = write_standing(store, scope, item, standing) {
            tracing::warn!(scope = %scope, item, error = %err, "score update failed");
            first_failure.get_or_insert(err);
        }
    }
    if let Some(err) = first_failure {
        return Err(err.into());
    }

    tracing::info!(
        user,
        item1 = %vote.item1,
        item2 = %vote.item2,
        winner = %vote.winner,
        "vote processed"
    );
    Ok(())
}

//! Pairwise-comparison engine: picks the next pair of items a user should compare and
//! folds the user's verdict into a per-user and a global Elo ladder.
//!
//! The crate does no IO of its own. Persistence goes through the [`ScoreStore`] trait.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

mod rater;
mod selector;
#[cfg(test)]
mod testing;

pub use rater::{
    compute_score_changes, expected_score, get_or_default, process_vote, Scope, DEFAULT_RATING,
    ELO_K,
};
pub use selector::{select_pair, select_pair_for_user};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RankerError {
    #[error("not enough items to compare: found {found}, need at least 2")]
    InsufficientItems { found: usize },
    #[error("invalid choice: {0}")]
    InvalidChoice(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure reported by a [`ScoreStore`], tagged with the operation and key involved.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("store operation {operation} failed for {key}: {message}")]
pub struct StoreError {
    pub operation: &'static str,
    pub key: String,
    pub message: String,
}

impl StoreError {
    #[must_use]
    pub fn new(operation: &'static str, key: impl Into<String>, message: impl Display) -> Self {
        Self { operation, key: key.into(), message: message.to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Item {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Rating and vote count of one item inside one ladder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Standing {
    pub rating: i64,
    pub num_votes: u64,
}

impl Standing {
    #[must_use]
    pub fn initial() -> Self {
        Self { rating: DEFAULT_RATING, num_votes: 0 }
    }
}

impl Default for Standing {
    fn default() -> Self {
        Self::initial()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserScore {
    pub item_name: String,
    pub user_name: String,
    pub rating: i64,
    pub num_votes: u64,
}

impl UserScore {
    #[must_use]
    pub fn new(item_name: &str, user_name: &str, standing: Standing) -> Self {
        Self {
            item_name: item_name.to_string(),
            user_name: user_name.to_string(),
            rating: standing.rating,
            num_votes: standing.num_votes,
        }
    }

    #[must_use]
    pub fn standing(&self) -> Standing {
        Standing { rating: self.rating, num_votes: self.num_votes }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalScore {
    pub item_name: String,
    pub rating: i64,
    pub num_votes: u64,
}

impl GlobalScore {
    #[must_use]
    pub fn new(item_name: &str, standing: Standing) -> Self {
        Self {
            item_name: item_name.to_string(),
            rating: standing.rating,
            num_votes: standing.num_votes,
        }
    }

    #[must_use]
    pub fn standing(&self) -> Standing {
        Standing { rating: self.rating, num_votes: self.num_votes }
    }
}

/// Two distinct item names offered to a user. Order carries no meaning.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ComparisonPair {
    pub item1: String,
    pub item2: String,
}

impl ComparisonPair {
    #[must_use]
    pub fn contains(&self, item_name: &str) -> bool {
        self.item1 == item_name || self.item2 == item_name
    }
}

impl Display for ComparisonPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} vs {}", self.item1, self.item2)
    }
}

/// A resolved comparison: the user saw `item1` and `item2` and picked `winner`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Vote {
    pub item1: String,
    pub item2: String,
    pub winner: String,
}

impl Vote {
    /// Check that the vote names two different items and that the winner is one of them.
    ///
    /// # Errors
    /// Returns [`RankerError::InvalidChoice`] when the winner is not one of the offered
    /// items, or both offered items are the same.
    pub fn validate(&self) -> Result<(), RankerError> {
        if self.winner != self.item1 && self.winner != self.item2 {
            return Err(RankerError::InvalidChoice(format!(
                "{} is not one of {} or {}",
                self.winner, self.item1, self.item2
            )));
        }
        if self.item1 == self.item2 {
            return Err(RankerError::InvalidChoice(format!(
                "cannot compare {} with itself",
                self.item1
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn item1_won(&self) -> bool {
        self.winner == self.item1
    }
}

/// Storage the engine reads scores from and writes them back to.
///
/// `Ok(None)` from a getter means the record has never been created; that is a normal
/// state, not a failure.
pub trait ScoreStore {
    /// All items, in listing order.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the population cannot be read.
    fn list_items(&self) -> Result<Vec<Item>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the lookup or decoding fails.
    fn get_user_score(&self, item: &str, user: &str) -> Result<Option<UserScore>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the insert fails.
    fn put_user_score(&mut self, score: &UserScore) -> Result<(), StoreError>;

    /// Overwrite rating and vote count of an existing record.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the write fails.
    fn update_user_score(&mut self, score: &UserScore) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the query or decoding fails.
    fn get_user_scores_for_user(&self, user: &str) -> Result<Vec<UserScore>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the lookup or decoding fails.
    fn get_global_score(&self, item: &str) -> Result<Option<GlobalScore>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the insert fails.
    fn put_global_score(&mut self, score: &GlobalScore) -> Result<(), StoreError>;

    /// Overwrite rating and vote count of an existing record.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the write fails.
    fn update_global_score(&mut self, score: &GlobalScore) -> Result<(), StoreError>;
}

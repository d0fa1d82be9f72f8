//! In-memory [`ScoreStore`] double with scripted failures and a write log.

use std::collections::{BTreeMap, BTreeSet};

use crate::{GlobalScore, Item, ScoreStore, Standing, StoreError, UserScore};

#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    pub items: Vec<Item>,
    pub user_scores: BTreeMap<(String, String), UserScore>,
    pub global_scores: BTreeMap<String, GlobalScore>,
    pub writes: Vec<String>,
    failures: BTreeSet<(&'static str, String)>,
}

impl MemoryStore {
    pub fn with_items(names: &[&str]) -> Self {
        Self {
            items: names
                .iter()
                .map(|name| Item { name: (*name).to_string(), description: String::new() })
                .collect(),
            ..Self::default()
        }
    }

    /// Make `operation` fail whenever it is called for `key` (`user/item` for user scores).
    pub fn failing(mut self, operation: &'static str, key: &str) -> Self {
        self.failures.insert((operation, key.to_string()));
        self
    }

    pub fn seed_user_score(&mut self, user: &str, item: &str, standing: Standing) {
        self.user_scores
            .insert((user.to_string(), item.to_string()), UserScore::new(item, user, standing));
    }

    pub fn seed_global_score(&mut self, item: &str, standing: Standing) {
        self.global_scores.insert(item.to_string(), GlobalScore::new(item, standing));
    }

    pub fn user_standing(&self, user: &str, item: &str) -> Option<Standing> {
        self.user_scores.get(&(user.to_string(), item.to_string())).map(UserScore::standing)
    }

    pub fn global_standing(&self, item: &str) -> Option<Standing> {
        self.global_scores.get(item).map(GlobalScore::standing)
    }

    pub fn writes_of(&self, operation: &str) -> Vec<&str> {
        self.writes
            .iter()
            .filter_map(|entry| entry.strip_prefix(operation)?.strip_prefix(':'))
            .collect()
    }

    fn check(&self, operation: &'static str, key: &str) -> Result<(), StoreError> {
        if self.failures.contains(&(operation, key.to_string())) {
            return Err(StoreError::new(operation, key, "scripted failure"));
        }
        Ok(())
    }

    fn record_write(&mut self, operation: &'static str, key: &str) -> Result<(), StoreError> {
        self.check(operation, key)?;
        self.writes.push(format!("{operation}:{key}"));
        Ok(())
    }
}

fn user_key(user: &str, item: &str) -> String {
    format!("{user}/{item}")
}

impl ScoreStore for MemoryStore {
    fn list_items(&self) -> Result<Vec<Item>, StoreError> {
        self.check("list_items", "*")?;
        Ok(self.items.clone())
    }

    fn get_user_score(&self, item: &str, user: &str) -> Result<Option<UserScore>, StoreError> {
        self.check("get_user_score", &user_key(user, item))?;
        Ok(self.user_scores.get(&(user.to_string(), item.to_string())).cloned())
    }

    fn put_user_score(&mut self, score: &UserScore) -> Result<(), StoreError> {
        self.record_write("put_user_score", &user_key(&score.user_name, &score.item_name))?;
        self.user_scores
            .insert((score.user_name.clone(), score.item_name.clone()), score.clone());
        Ok(())
    }

    fn update_user_score(&mut self, score: &UserScore) -> Result<(), StoreError> {
        let key = user_key(&score.user_name, &score.item_name);
        self.record_write("update_user_score", &key)?;
        match self.user_scores.get_mut(&(score.user_name.clone(), score.item_name.clone())) {
            Some(existing) => {
                existing.rating = score.rating;
                existing.num_votes = score.num_votes;
                Ok(())
            }
            None => Err(StoreError::new("update_user_score", key, "no such record")),
        }
    }

    fn get_user_scores_for_user(&self, user: &str) -> Result<Vec<UserScore>, StoreError> {
        self.check("get_user_scores_for_user", user)?;
        Ok(self
            .user_scores
            .values()
            .filter(|score| score.user_name == user)
            .cloned()
            .collect())
    }

    fn get_global_score(&self, item: &str) -> Result<Option<GlobalScore>, StoreError> {
        self.check("get_global_score", item)?;
        Ok(self.global_scores.get(item).cloned())
    }

    fn put_global_score(&mut self, score: &GlobalScore) -> Result<(), StoreError> {
        self.record_write("put_global_score", &score.item_name)?;
        self.global_scores.insert(score.item_name.clone(), score.clone());
        Ok(())
    }

    fn update_global_score(&mut self, score: &GlobalScore) -> Result<(), StoreError> {
        self.record_write("update_global_score", &score.item_name)?;
        match self.global_scores.get_mut(&score.item_name) {
            Some(existing) => {
                existing.rating = score.rating;
                existing.num_votes = score.num_votes;
                Ok(())
            }
            None => Err(StoreError::new("update_global_score", &score.item_name, "no such record")),
        }
    }
}

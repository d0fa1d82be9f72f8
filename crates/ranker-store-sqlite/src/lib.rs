use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ranker_core::{GlobalScore, Item, ScoreStore, StoreError, UserScore};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS items (
  name TEXT PRIMARY KEY,
  description TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
  name TEXT PRIMARY KEY,
  password_hash TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_scores (
  user_name TEXT NOT NULL,
  item_name TEXT NOT NULL,
  rating INTEGER NOT NULL,
  num_votes INTEGER NOT NULL CHECK (num_votes >= 0),
  PRIMARY KEY (user_name, item_name),
  FOREIGN KEY (user_name) REFERENCES users(name) ON DELETE CASCADE,
  FOREIGN KEY (item_name) REFERENCES items(name) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS global_scores (
  item_name TEXT PRIMARY KEY,
  rating INTEGER NOT NULL,
  num_votes INTEGER NOT NULL CHECK (num_votes >= 0),
  FOREIGN KEY (item_name) REFERENCES items(name) ON DELETE CASCADE
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_user_scores_item ON user_scores(item_name);
CREATE INDEX IF NOT EXISTS idx_user_scores_user_rating ON user_scores(user_name, rating DESC);
CREATE INDEX IF NOT EXISTS idx_global_scores_rating ON global_scores(rating DESC);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

const DROP_ALL_SQL: &str = r"
DROP TABLE IF EXISTS user_scores;
DROP TABLE IF EXISTS global_scores;
DROP TABLE IF EXISTS users;
DROP TABLE IF EXISTS items;
DROP TABLE IF EXISTS schema_migrations;
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Stored account row. The hash is a PHC string and never leaves the api layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    pub password_hash: String,
    pub created_at: String,
}

struct ScoreRow {
    item_name: String,
    user_name: Option<String>,
    rating: i64,
    num_votes: i64,
}

impl ScoreRow {
    fn num_votes(&self) -> Result<u64> {
        u64::try_from(self.num_votes).with_context(|| {
            format!(
                "stored num_votes {} for {} is not a vote count",
                self.num_votes, self.item_name
            )
        })
    }

    fn into_user_score(self) -> Result<UserScore> {
        let num_votes = self.num_votes()?;
        let user_name = self
            .user_name
            .ok_or_else(|| anyhow!("user score row for {} has no user", self.item_name))?;
        Ok(UserScore { item_name: self.item_name, user_name, rating: self.rating, num_votes })
    }

    fn into_global_score(self) -> Result<GlobalScore> {
        let num_votes = self.num_votes()?;
        Ok(GlobalScore { item_name: self.item_name, rating: self.rating, num_votes })
    }
}

impl SqliteStore {
    /// Open a SQLite-backed ranker store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version and return
    /// the versions applied by this call.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than this
    /// build understands.
    pub fn migrate(&mut self) -> Result<Vec<i64>> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut applied = Vec::new();
        for (version, sql) in MIGRATIONS {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .with_context(|| format!("failed to start migration v{version} transaction"))?;
            // Another connection may have applied it while we waited for the write lock.
            if current_schema_version(&tx)? >= version {
                continue;
            }
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
            record_schema_version(&tx, version)?;
            tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
            applied.push(version);
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(applied)
    }

    /// Drop every ranker table, including migration bookkeeping.
    ///
    /// # Errors
    /// Returns an error when the tables cannot be dropped.
    pub fn reset(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start reset transaction")?;
        tx.execute_batch(DROP_ALL_SQL).context("failed to drop ranker tables")?;
        tx.commit().context("failed to commit reset transaction")?;
        Ok(())
    }

    /// Create an item, or overwrite the description of an existing one in place.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert_item(&mut self, item: &Item) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO items(name, description, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET description = excluded.description",
                params![item.name, item.description, now_rfc3339()?],
            )
            .with_context(|| format!("failed to upsert item {}", item.name))?;
        Ok(())
    }

    /// All items in insertion order.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn all_items(&self) -> Result<Vec<Item>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, description FROM items ORDER BY rowid ASC")
            .context("failed to prepare item listing")?;
        let rows = stmt.query_map([], |row| {
            Ok(Item { name: row.get(0)?, description: row.get(1)? })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read items")
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find_item(&self, name: &str) -> Result<Option<Item>> {
        self.conn
            .query_row(
                "SELECT name, description FROM items WHERE name = ?1",
                params![name],
                |row| Ok(Item { name: row.get(0)?, description: row.get(1)? }),
            )
            .optional()
            .with_context(|| format!("failed to look up item {name}"))
    }

    /// Delete an item and, through the foreign keys, every score that references it.
    /// Returns whether the item existed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_item(&mut self, name: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM items WHERE name = ?1", params![name])
            .with_context(|| format!("failed to delete item {name}"))?;
        Ok(deleted > 0)
    }

    /// Insert a new user. Returns `false` without touching the row when the name is taken.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_user(&mut self, name: &str, password_hash: &str) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO users(name, password_hash, created_at) VALUES (?1, ?2, ?3)",
                params![name, password_hash, now_rfc3339()?],
            )
            .with_context(|| format!("failed to insert user {name}"))?;
        Ok(inserted > 0)
    }

    /// Create the user or replace its password hash.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert_user(&mut self, name: &str, password_hash: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO users(name, password_hash, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET password_hash = excluded.password_hash",
                params![name, password_hash, now_rfc3339()?],
            )
            .with_context(|| format!("failed to upsert user {name}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find_user(&self, name: &str) -> Result<Option<UserRecord>> {
        self.conn
            .query_row(
                "SELECT name, password_hash, created_at FROM users WHERE name = ?1",
                params![name],
                |row| {
                    Ok(UserRecord {
                        name: row.get(0)?,
                        password_hash: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to look up user {name}"))
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, password_hash, created_at FROM users ORDER BY rowid ASC")
            .context("failed to prepare user listing")?;
        let rows = stmt.query_map([], |row| {
            Ok(UserRecord {
                name: row.get(0)?,
                password_hash: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read users")
    }

    /// Delete a user together with all of the user's scores. Returns whether it existed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_user(&mut self, name: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM users WHERE name = ?1", params![name])
            .with_context(|| format!("failed to delete user {name}"))?;
        Ok(deleted > 0)
    }

    /// # Errors
    /// Returns an error when the lookup fails or the stored vote count is invalid.
    pub fn fetch_user_score(&self, item: &str, user: &str) -> Result<Option<UserScore>> {
        let row = self
            .conn
            .query_row(
                "SELECT item_name, user_name, rating, num_votes FROM user_scores
                 WHERE user_name = ?1 AND item_name = ?2",
                params![user, item],
                score_row,
            )
            .optional()
            .with_context(|| format!("failed to look up score of {item} for {user}"))?;
        row.map(ScoreRow::into_user_score).transpose()
    }

    /// # Errors
    /// Returns an error when the insert fails, including when the record already exists.
    pub fn insert_user_score(&mut self, score: &UserScore) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_scores(user_name, item_name, rating, num_votes)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    score.user_name,
                    score.item_name,
                    score.rating,
                    vote_count(score.num_votes)?
                ],
            )
            .with_context(|| {
                format!("failed to insert score of {} for {}", score.item_name, score.user_name)
            })?;
        Ok(())
    }

    /// Overwrite rating and vote count of an existing record.
    ///
    /// # Errors
    /// Returns an error when the write fails or no such record exists.
    pub fn overwrite_user_score(&mut self, score: &UserScore) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE user_scores SET rating = ?3, num_votes = ?4
                 WHERE user_name = ?1 AND item_name = ?2",
                params![
                    score.user_name,
                    score.item_name,
                    score.rating,
                    vote_count(score.num_votes)?
                ],
            )
            .with_context(|| {
                format!("failed to update score of {} for {}", score.item_name, score.user_name)
            })?;
        if updated == 0 {
            return Err(anyhow!(
                "no score of {} for {} to update",
                score.item_name,
                score.user_name
            ));
        }
        Ok(())
    }

    /// Every score the user holds, in creation order.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored vote count is invalid.
    pub fn user_scores_for(&self, user: &str) -> Result<Vec<UserScore>> {
        self.query_user_scores(
            "SELECT item_name, user_name, rating, num_votes FROM user_scores
             WHERE user_name = ?1 ORDER BY rowid ASC",
            user,
        )
    }

    /// The user's scores, best rated first. Ties are broken by item name.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored vote count is invalid.
    pub fn user_rankings(&self, user: &str) -> Result<Vec<UserScore>> {
        self.query_user_scores(
            "SELECT item_name, user_name, rating, num_votes FROM user_scores
             WHERE user_name = ?1 ORDER BY rating DESC, item_name ASC",
            user,
        )
    }

    fn query_user_scores(&self, sql: &str, user: &str) -> Result<Vec<UserScore>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare user score query")?;
        let rows = stmt
            .query_map(params![user], score_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to read scores for {user}"))?;
        rows.into_iter().map(ScoreRow::into_user_score).collect()
    }

    /// # Errors
    /// Returns an error when the lookup fails or the stored vote count is invalid.
    pub fn fetch_global_score(&self, item: &str) -> Result<Option<GlobalScore>> {
        let row = self
            .conn
            .query_row(
                "SELECT item_name, NULL, rating, num_votes FROM global_scores WHERE item_name = ?1",
                params![item],
                score_row,
            )
            .optional()
            .with_context(|| format!("failed to look up global score of {item}"))?;
        row.map(ScoreRow::into_global_score).transpose()
    }

    /// # Errors
    /// Returns an error when the insert fails, including when the record already exists.
    pub fn insert_global_score(&mut self, score: &GlobalScore) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO global_scores(item_name, rating, num_votes) VALUES (?1, ?2, ?3)",
                params![score.item_name, score.rating, vote_count(score.num_votes)?],
            )
            .with_context(|| format!("failed to insert global score of {}", score.item_name))?;
        Ok(())
    }

    /// Overwrite rating and vote count of an existing record.
    ///
    /// # Errors
    /// Returns an error when the write fails or no such record exists.
    pub fn overwrite_global_score(&mut self, score: &GlobalScore) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE global_scores SET rating = ?2, num_votes = ?3 WHERE item_name = ?1",
                params![score.item_name, score.rating, vote_count(score.num_votes)?],
            )
            .with_context(|| format!("failed to update global score of {}", score.item_name))?;
        if updated == 0 {
            return Err(anyhow!("no global score of {} to update", score.item_name));
        }
        Ok(())
    }

    /// Global scores, best rated first. Ties are broken by item name.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored vote count is invalid.
    pub fn global_rankings(&self) -> Result<Vec<GlobalScore>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT item_name, NULL, rating, num_votes FROM global_scores
                 ORDER BY rating DESC, item_name ASC",
            )
            .context("failed to prepare global rankings query")?;
        let rows = stmt
            .query_map([], score_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read global scores")?;
        rows.into_iter().map(ScoreRow::into_global_score).collect()
    }
}

fn store_error(
    operation: &'static str,
    key: impl Into<String>,
) -> impl FnOnce(anyhow::Error) -> StoreError {
    let key = key.into();
    move |err| StoreError::new(operation, key, format!("{err:#}"))
}

fn user_key(user: &str, item: &str) -> String {
    format!("{user}/{item}")
}

impl ScoreStore for SqliteStore {
    fn list_items(&self) -> Result<Vec<Item>, StoreError> {
        self.all_items().map_err(store_error("list_items", "*"))
    }

    fn get_user_score(&self, item: &str, user: &str) -> Result<Option<UserScore>, StoreError> {
        self.fetch_user_score(item, user)
            .map_err(store_error("get_user_score", user_key(user, item)))
    }

    fn put_user_score(&mut self, score: &UserScore) -> Result<(), StoreError> {
        self.insert_user_score(score)
            .map_err(store_error("put_user_score", user_key(&score.user_name, &score.item_name)))
    }

    fn update_user_score(&mut self, score: &UserScore) -> Result<(), StoreError> {
        self.overwrite_user_score(score)
            .map_err(store_error("update_user_score", user_key(&score.user_name, &score.item_name)))
    }

    fn get_user_scores_for_user(&self, user: &str) -> Result<Vec<UserScore>, StoreError> {
        self.user_scores_for(user).map_err(store_error("get_user_scores_for_user", user))
    }

    fn get_global_score(&self, item: &str) -> Result<Option<GlobalScore>, StoreError> {
        self.fetch_global_score(item).map_err(store_error("get_global_score", item))
    }

    fn put_global_score(&mut self, score: &GlobalScore) -> Result<(), StoreError> {
        self.insert_global_score(score)
            .map_err(store_error("put_global_score", score.item_name.as_str()))
    }

    fn update_global_score(&mut self, score: &GlobalScore) -> Result<(), StoreError> {
        self.overwrite_global_score(score)
            .map_err(store_error("update_global_score", score.item_name.as_str()))
    }
}

fn score_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScoreRow> {
    Ok(ScoreRow {
        item_name: row.get(0)?,
        user_name: row.get(1)?,
        rating: row.get(2)?,
        num_votes: row.get(3)?,
    })
}

fn vote_count(num_votes: u64) -> Result<i64> {
    i64::try_from(num_votes)
        .with_context(|| format!("vote count {num_votes} exceeds storage range"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

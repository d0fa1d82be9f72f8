use std::path::PathBuf;

use ranker_core::{
    process_vote, select_pair_for_user, ComparisonPair, GlobalScore, Item, RankerError, UserScore,
    Vote,
};
use ranker_store_sqlite::{SchemaStatus, SqliteStore, UserRecord};
use serde::{Deserialize, Serialize};

pub mod auth;

pub use auth::{Principal, ADMIN_USER};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Ranker(#[from] RankerError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Stable machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Ranker(RankerError::InvalidChoice(_)) => "invalid_choice",
            Self::Ranker(RankerError::InsufficientItems { .. }) => "insufficient_items",
            Self::Ranker(RankerError::Store(_)) => "store_error",
            Self::Internal(_) => "internal",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddItemRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddUserRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteRequest {
    pub item1: String,
    pub item2: String,
    pub winner: String,
}

/// Public view of an account; the password hash never leaves the api.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserView {
    pub name: String,
    pub is_admin: bool,
    pub created_at: String,
}

impl From<UserRecord> for UserView {
    fn from(record: UserRecord) -> Self {
        Self {
            is_admin: record.name == ADMIN_USER,
            name: record.name,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RankerApi {
    db_path: PathBuf,
    token_secret: Vec<u8>,
}

impl RankerApi {
    #[must_use]
    pub fn new(db_path: PathBuf, token_secret: impl Into<Vec<u8>>) -> Self {
        Self { db_path, token_secret: token_secret.into() }
    }

    fn open_store(&self) -> anyhow::Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> anyhow::Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, ApiError> {
        let store = self.open_store()?;
        Ok(store.schema_status()?)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, ApiError> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Delete every item, user and score, leaving an empty migrated database.
    ///
    /// # Errors
    /// Returns an error when the tables cannot be dropped or recreated.
    pub fn reset(&self) -> Result<SchemaStatus, ApiError> {
        let mut store = self.open_store()?;
        store.reset()?;
        store.migrate()?;
        tracing::warn!(db = %self.db_path.display(), "database reset");
        Ok(store.schema_status()?)
    }

    /// Create the administrator account, or reset its password when it already exists.
    ///
    /// # Errors
    /// Returns an error when hashing or persistence fails.
    pub fn ensure_admin(&self, password: &str) -> Result<UserView, ApiError> {
        if password.is_empty() {
            return Err(ApiError::BadRequest("admin password must not be empty".to_string()));
        }
        let mut store = self.open_migrated()?;
        store.upsert_user(ADMIN_USER, &auth::hash_password(password)?)?;
        tracing::info!(user = ADMIN_USER, "administrator account ensured");
        let record = store
            .find_user(ADMIN_USER)?
            .ok_or_else(|| ApiError::NotFound(format!("user {ADMIN_USER}")))?;
        Ok(record.into())
    }

    /// Register a new account. The administrator account is only created by
    /// [`RankerApi::ensure_admin`].
    ///
    /// # Errors
    /// Returns [`ApiError::BadRequest`] for an empty name or password and
    /// [`ApiError::Conflict`] when the name is taken or reserved.
    pub fn register_user(&self, input: AddUserRequest) -> Result<UserView, ApiError> {
        let name = input.name.trim();
        if name.is_empty() || input.password.is_empty() {
            return Err(ApiError::BadRequest("user name and password are required".to_string()));
        }
        if name == ADMIN_USER {
            tracing::warn!(user = name, "registration of reserved name rejected");
            return Err(ApiError::Conflict(format!("user name {name} is reserved")));
        }
        let mut store = self.open_migrated()?;
        let hash = auth::hash_password(&input.password)?;
        if !store.insert_user(name, &hash)? {
            return Err(ApiError::Conflict(format!("user {name} already exists")));
        }
        tracing::info!(user = name, "user registered");
        let record =
            store.find_user(name)?.ok_or_else(|| ApiError::NotFound(format!("user {name}")))?;
        Ok(record.into())
    }

    /// # Errors
    /// Returns [`ApiError::Forbidden`] unless the caller is the administrator.
    pub fn list_users(&self, caller: &Principal) -> Result<Vec<UserView>, ApiError> {
        caller.require_admin()?;
        let store = self.open_migrated()?;
        Ok(store.list_users()?.into_iter().map(UserView::from).collect())
    }

    /// # Errors
    /// Returns [`ApiError::Forbidden`] for other users' accounts and
    /// [`ApiError::NotFound`] when the account does not exist.
    pub fn get_user(&self, caller: &Principal, name: &str) -> Result<UserView, ApiError> {
        caller.require_self_or_admin(name)?;
        let store = self.open_migrated()?;
        let record =
            store.find_user(name)?.ok_or_else(|| ApiError::NotFound(format!("user {name}")))?;
        Ok(record.into())
    }

    /// Delete an account and all of its scores.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for other users' accounts and
    /// [`ApiError::NotFound`] when the account does not exist.
    pub fn delete_user(&self, caller: &Principal, name: &str) -> Result<(), ApiError> {
        caller.require_self_or_admin(name)?;
        let mut store = self.open_migrated()?;
        if !store.delete_user(name)? {
            return Err(ApiError::NotFound(format!("user {name}")));
        }
        tracing::info!(user = name, by = %caller.name, "user deleted");
        Ok(())
    }

    /// Exchange credentials for a bearer token.
    ///
    /// # Errors
    /// Returns [`ApiError::Unauthorized`] for an unknown user or a wrong password.
    pub fn login(&self, input: &LoginRequest) -> Result<LoginResponse, ApiError> {
        let store = self.open_migrated()?;
        let Some(record) = store.find_user(&input.username)? else {
            return Err(ApiError::Unauthorized("invalid username or password".to_string()));
        };
        if !auth::verify_password(&input.password, &record.password_hash)? {
            tracing::warn!(user = %input.username, "login rejected");
            return Err(ApiError::Unauthorized("invalid username or password".to_string()));
        }
        let token = auth::issue_token(&self.token_secret, &record.name)?;
        Ok(LoginResponse { token })
    }

    /// Resolve the caller from an `Authorization` header value.
    ///
    /// # Errors
    /// Returns [`ApiError::Unauthorized`] when the header is missing, the token does not
    /// verify, or its subject no longer exists.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<Principal, ApiError> {
        let Some(token) = authorization.filter(|value| !value.trim().is_empty()) else {
            return Err(ApiError::Unauthorized("missing token for authorization".to_string()));
        };
        let claims = auth::verify_token(&self.token_secret, token)?;
        let store = self.open_migrated()?;
        if store.find_user(&claims.sub)?.is_none() {
            return Err(ApiError::Unauthorized(format!("user {} no longer exists", claims.sub)));
        }
        Ok(Principal::new(claims.sub))
    }

    /// # Errors
    /// Returns an error when items cannot be read.
    pub fn list_items(&self) -> Result<Vec<Item>, ApiError> {
        let store = self.open_migrated()?;
        Ok(store.all_items()?)
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] when the item does not exist.
    pub fn get_item(&self, name: &str) -> Result<Item, ApiError> {
        let store = self.open_migrated()?;
        store.find_item(name)?.ok_or_else(|| ApiError::NotFound(format!("item {name}")))
    }

    /// Create an item or overwrite the description of an existing one.
    ///
    /// # Errors
    /// Returns [`ApiError::BadRequest`] for an empty name.
    pub fn add_item(&self, caller: &Principal, input: AddItemRequest) -> Result<Item, ApiError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(ApiError::BadRequest("item name is required".to_string()));
        }
        let item = Item { name: name.to_string(), description: input.description };
        let mut store = self.open_migrated()?;
        store.upsert_item(&item)?;
        tracing::info!(item = %item.name, by = %caller.name, "item saved");
        Ok(item)
    }

    /// Delete an item and every score that references it.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] unless the caller is the administrator and
    /// [`ApiError::NotFound`] when the item does not exist.
    pub fn delete_item(&self, caller: &Principal, name: &str) -> Result<(), ApiError> {
        caller.require_admin()?;
        let mut store = self.open_migrated()?;
        if !store.delete_item(name)? {
            return Err(ApiError::NotFound(format!("item {name}")));
        }
        tracing::info!(item = name, "item deleted");
        Ok(())
    }

    /// Choose the next pair for `user`, which defaults to the caller.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] when asking on behalf of someone else without admin
    /// rights, [`ApiError::NotFound`] for an unknown user, and
    /// [`RankerError::InsufficientItems`] when fewer than two items exist.
    pub fn next_comparison(
        &self,
        caller: &Principal,
        user: Option<&str>,
    ) -> Result<ComparisonPair, ApiError> {
        let user = user.unwrap_or(caller.name.as_str());
        caller.require_self_or_admin(user)?;
        let store = self.open_migrated()?;
        if store.find_user(user)?.is_none() {
            return Err(ApiError::NotFound(format!("user {user}")));
        }
        Ok(select_pair_for_user(&store, user, &mut rand::thread_rng())?)
    }

    /// Record the caller's verdict. New ratings are not reported back.
    ///
    /// # Errors
    /// Returns [`RankerError::InvalidChoice`] for a malformed vote, [`ApiError::NotFound`]
    /// when either item does not exist, and [`RankerError::Store`] when a write fails.
    pub fn submit_vote(&self, caller: &Principal, input: VoteRequest) -> Result<(), ApiError> {
        let vote = Vote { item1: input.item1, item2: input.item2, winner: input.winner };
        vote.validate()?;
        let mut store = self.open_migrated()?;
        for name in [&vote.item1, &vote.item2] {
            if store.find_item(name)?.is_none() {
                return Err(ApiError::NotFound(format!("item {name}")));
            }
        }

        process_vote(&mut store, &caller.name, &vote)?;
        Ok(())
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] when the item has never been voted on.
    pub fn global_score(&self, item: &str) -> Result<GlobalScore, ApiError> {
        let store = self.open_migrated()?;
        store
            .fetch_global_score(item)?
            .ok_or_else(|| ApiError::NotFound(format!("no votes recorded for item {item}")))
    }

    /// # Errors
    /// Returns [`ApiError::Forbidden`] for other users' scores and [`ApiError::NotFound`]
    /// when the user has never voted on the item.
    pub fn user_score(
        &self,
        caller: &Principal,
        item: &str,
        user: &str,
    ) -> Result<UserScore, ApiError> {
        caller.require_self_or_admin(user)?;
        let store = self.open_migrated()?;
        store.fetch_user_score(item, user)?.ok_or_else(|| {
            ApiError::NotFound(format!("no votes by {user} recorded for item {item}"))
        })
    }

    /// Global scores, best rated first.
    ///
    /// # Errors
    /// Returns an error when scores cannot be read.
    pub fn global_rankings(&self) -> Result<Vec<GlobalScore>, ApiError> {
        let store = self.open_migrated()?;
        Ok(store.global_rankings()?)
    }

    /// One user's scores, best rated first.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for other users' rankings.
    pub fn user_rankings(
        &self,
        caller: &Principal,
        user: &str,
    ) -> Result<Vec<UserScore>, ApiError> {
        caller.require_self_or_admin(user)?;
        let store = self.open_migrated()?;
        Ok(store.user_rankings(user)?)
    }
}

//! Persistence boundary for users, sessions and moderator promotion requests.
//!
//! The core never touches a connection directly: handlers and the session
//! manager receive an `Arc<dyn CredentialStore>` built once at startup.
//! `PgStore` is the production implementation; `MemoryStore` backs the
//! router tests.
//!
//! Role and session-source values cross this boundary as plain strings so an
//! unexpected value stored in the database is reported by the caller as a
//! configuration fault instead of being coerced here.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{fmt, str::FromStr};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated")]
    UniqueViolation,
    #[error("record not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Where a session row came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionSource {
    /// Issued after a password login.
    Password,
    /// Issued after an external identity provider vouched for the email.
    Federated,
}

impl SessionSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Federated => "federated",
        }
    }
}

impl fmt::Display for SessionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "password" => Ok(Self::Password),
            "federated" => Ok(Self::Federated),
            other => Err(format!("unknown session source: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    /// `None` for accounts that only ever logged in through a provider.
    pub password_hash: Option<String>,
    pub role: String,
}

#[derive(Clone, Debug)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub password_hash: Option<String>,
    pub role: String,
}

/// Columns to change on an existing user; `None` keeps the stored value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub username: Option<String>,
    pub password_hash: Option<String>,
}

/// Session row as written; `token_hash` is the SHA-256 of the bearer token.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub token_hash: Vec<u8>,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub source: SessionSource,
}

/// Session row joined with its owner. Expiry is checked by the caller so an
/// expired row can be told apart from a missing one.
#[derive(Clone, Debug)]
pub struct SessionLookup {
    pub user_id: Uuid,
    pub role: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub source: SessionSource,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
}

#[derive(Clone, Debug)]
pub struct PendingPromotion {
    pub id: i64,
    pub user_id: Uuid,
    pub username: String,
    pub requested_at: DateTime<Utc>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Round-trip to the backing store, used by `/health`.
    async fn ping(&self) -> StoreResult<()>;

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>>;

    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<UserRecord>>;

    /// Returns `StoreError::UniqueViolation` when the email is taken.
    async fn insert_user(&self, user: &NewUser) -> StoreResult<()>;

    /// Returns `StoreError::NotFound` when no user has this id.
    async fn set_user_role(&self, id: Uuid, role: &str) -> StoreResult<()>;

    /// Returns `StoreError::UniqueViolation` when the new email belongs to
    /// another account and `StoreError::NotFound` when no user has this id.
    async fn update_user(&self, id: Uuid, update: &UserUpdate) -> StoreResult<()>;

    async fn list_users_with_role(&self, role: &str) -> StoreResult<Vec<UserSummary>>;

    async fn insert_session(&self, session: &NewSession) -> StoreResult<()>;

    async fn lookup_session(&self, token_hash: &[u8]) -> StoreResult<Option<SessionLookup>>;

    /// Idempotent; deleting a missing row is not an error.
    async fn delete_session(&self, token_hash: &[u8]) -> StoreResult<()>;

    /// Deletes every session of `user_id` whose hash is not in `keep`,
    /// returning the count.
    async fn delete_user_sessions(&self, user_id: Uuid, keep: &[Vec<u8>]) -> StoreResult<u64>;

    /// Deletes every session with `expires_at <= now`, returning the count.
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Returns `StoreError::UniqueViolation` if the user already has a pending
    /// request and `StoreError::NotFound` if the user does not exist.
    async fn insert_promotion_request(&self, user_id: Uuid) -> StoreResult<i64>;

    async fn list_pending_promotions(&self) -> StoreResult<Vec<PendingPromotion>>;

    /// Promote the requesting user to moderator and mark the request approved,
    /// atomically. Returns the promoted user id, or `NotFound` if the request
    /// is unknown or no longer pending, or its user is gone or already above
    /// `user`.
    async fn approve_promotion(&self, request_id: i64, approver: Uuid) -> StoreResult<Uuid>;

    /// Returns `NotFound` if the request is unknown or no longer pending.
    async fn reject_promotion(&self, request_id: i64, approver: Uuid) -> StoreResult<()>;
}

//! PostgreSQL-backed credential store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, Connection, PgPool, Row};
use std::time::Duration;
use tracing::{info_span, Instrument, Span};
use uuid::Uuid;

use super::{
    CredentialStore, NewSession, NewUser, PendingPromotion, SessionLookup, StoreError,
    StoreResult, UserRecord, UserSummary, UserUpdate,
};

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

fn db_span(operation: &'static str, statement: &str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn map_err(err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::UniqueViolation
    } else if is_foreign_key_violation(&err) {
        StoreError::NotFound
    } else {
        StoreError::Database(err)
    }
}

fn has_sqlstate(err: &sqlx::Error, sqlstate: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == sqlstate),
        _ => false,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, "23505")
}

/// A referenced row is gone, e.g. a promotion request for a deleted user.
fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, "23503")
}

fn user_from_row(row: &sqlx::postgres::PgRow) -> UserRecord {
    UserRecord {
        id: row.get("id"),
        email: row.get("email"),
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        role: row.get("role"),
    }
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply the bundled schema.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable or the schema fails to apply.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .acquire_timeout(Duration::from_secs(10))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;

        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&pool)
            .instrument(db_span("DDL", "schema.sql"))
            .await
            .context("Failed to apply database schema")?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self
            .pool
            .acquire()
            .instrument(info_span!(
                "db.acquire",
                db.system = "postgresql",
                db.operation = "ACQUIRE"
            ))
            .await?;
        conn.ping()
            .instrument(info_span!(
                "db.ping",
                db.system = "postgresql",
                db.operation = "PING"
            ))
            .await?;
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>> {
        let query = "SELECT id, email, username, password_hash, role FROM users WHERE email = $1";
        let row = sqlx::query(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        let query = "SELECT id, email, username, password_hash, role FROM users WHERE id = $1";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn insert_user(&self, user: &NewUser) -> StoreResult<()> {
        let query = r"
            INSERT INTO users (id, email, username, password_hash, role)
            VALUES ($1, $2, $3, $4, $5)
        ";
        sqlx::query(query)
            .bind(user.id)
            .bind(&user.email)
            .bind(&user.username)
            .bind(user.password_hash.as_deref())
            .bind(&user.role)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn set_user_role(&self, id: Uuid, role: &str) -> StoreResult<()> {
        let query = "UPDATE users SET role = $2 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .bind(role)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_user(&self, id: Uuid, update: &UserUpdate) -> StoreResult<()> {
        let query = r"
            UPDATE users
            SET email = COALESCE($2, email),
                username = COALESCE($3, username),
                password_hash = COALESCE($4, password_hash)
            WHERE id = $1
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(update.email.as_deref())
            .bind(update.username.as_deref())
            .bind(update.password_hash.as_deref())
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .map_err(map_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_users_with_role(&self, role: &str) -> StoreResult<Vec<UserSummary>> {
        let query = "SELECT id, username FROM users WHERE role = $1 ORDER BY username";
        let rows = sqlx::query(query)
            .bind(role)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(rows
            .iter()
            .map(|row| UserSummary {
                id: row.get("id"),
                username: row.get("username"),
            })
            .collect())
    }

    async fn insert_session(&self, session: &NewSession) -> StoreResult<()> {
        let query = r"
            INSERT INTO sessions (id, user_id, expires_at, source)
            VALUES ($1, $2, $3, $4)
        ";
        sqlx::query(query)
            .bind(&session.token_hash)
            .bind(session.user_id)
            .bind(session.expires_at)
            .bind(session.source.as_str())
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn lookup_session(&self, token_hash: &[u8]) -> StoreResult<Option<SessionLookup>> {
        let query = r"
            SELECT sessions.user_id, sessions.expires_at, sessions.source, users.role
            FROM sessions
            LEFT JOIN users ON users.id = sessions.user_id
            WHERE sessions.id = $1
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let source: String = row.get("source");
        let source = source.parse().map_err(StoreError::Unavailable)?;

        Ok(Some(SessionLookup {
            user_id: row.get("user_id"),
            role: row.get("role"),
            expires_at: row.get("expires_at"),
            source,
        }))
    }

    async fn delete_session(&self, token_hash: &[u8]) -> StoreResult<()> {
        let query = "DELETE FROM sessions WHERE id = $1";
        sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(())
    }

    async fn delete_user_sessions(&self, user_id: Uuid, keep: &[Vec<u8>]) -> StoreResult<u64> {
        let query = "DELETE FROM sessions WHERE user_id = $1 AND NOT (id = ANY($2))";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(keep)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let query = "DELETE FROM sessions WHERE expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_promotion_request(&self, user_id: Uuid) -> StoreResult<i64> {
        let query = "INSERT INTO promotion_requests (user_id) VALUES ($1) RETURNING id";
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(map_err)?;
        Ok(row.get("id"))
    }

    async fn list_pending_promotions(&self) -> StoreResult<Vec<PendingPromotion>> {
        let query = r"
            SELECT promotion_requests.id, promotion_requests.user_id,
                   promotion_requests.requested_at, users.username
            FROM promotion_requests
            JOIN users ON users.id = promotion_requests.user_id
            WHERE promotion_requests.status = 'pending'
            ORDER BY promotion_requests.requested_at
        ";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(rows
            .iter()
            .map(|row| PendingPromotion {
                id: row.get("id"),
                user_id: row.get("user_id"),
                username: row.get("username"),
                requested_at: row.get("requested_at"),
            })
            .collect())
    }

    async fn approve_promotion(&self, request_id: i64, approver: Uuid) -> StoreResult<Uuid> {
        // Role change and request status must never diverge; dropping the
        // transaction on any early return rolls both back.
        let mut tx = self.pool.begin().await?;

        let query = r"
            UPDATE promotion_requests
            SET status = 'approved', decided_by = $2, decided_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING user_id
        ";
        let row = sqlx::query(query)
            .bind(request_id)
            .bind(approver)
            .fetch_optional(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(StoreError::NotFound);
        };
        let user_id: Uuid = row.get("user_id");

        // Only guests and users are promoted; an approval must never demote.
        let query = "UPDATE users SET role = 'moderator' WHERE id = $1 AND role IN ('guest', 'user')";
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound);
        }

        tx.commit().await?;
        Ok(user_id)
    }

    async fn reject_promotion(&self, request_id: i64, approver: Uuid) -> StoreResult<()> {
        let query = r"
            UPDATE promotion_requests
            SET status = 'rejected', decided_by = $2, decided_at = NOW()
            WHERE id = $1 AND status = 'pending'
        ";
        let result = sqlx::query(query)
            .bind(request_id)
            .bind(approver)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

//! Session issuance, resolution and revocation.
//!
//! Tokens are opaque 32-byte random values handed to the client in a cookie
//! (or presented back as `Authorization: Bearer`). Only their SHA-256 hash is
//! stored, so a database dump cannot be replayed as live sessions.
//!
//! Password logins and federated logins use separate cookies. Both are backed
//! by rows in the same table; `resolve_caller` checks the local credential
//! first and falls back to the federated cookie.

use axum::http::{header::InvalidHeaderValue, HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{
    error::AuthError,
    role::Role,
    utils::{extract_bearer_token, extract_cookie, generate_token, hash_session_token},
};
use crate::store::{CredentialStore, NewSession, SessionLookup, SessionSource};

pub const SESSION_COOKIE: &str = "pordisto_session";
pub const FEDERATED_COOKIE: &str = "pordisto_federated";
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Raw tokens carried by the request: the local credential (cookie, else
/// bearer header) and the federated cookie.
fn presented_tokens(headers: &HeaderMap) -> impl Iterator<Item = String> {
    [
        extract_cookie(headers, SESSION_COOKIE).or_else(|| extract_bearer_token(headers)),
        extract_cookie(headers, FEDERATED_COOKIE),
    ]
    .into_iter()
    .flatten()
}

/// A freshly created session. `token` is the only copy of the raw credential.
#[derive(Clone, Debug)]
pub struct IssuedSession {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub source: SessionSource,
}

/// The authenticated identity behind a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
    pub source: SessionSource,
}

#[must_use]
pub const fn cookie_name(source: SessionSource) -> &'static str {
    match source {
        SessionSource::Password => SESSION_COOKIE,
        SessionSource::Federated => FEDERATED_COOKIE,
    }
}

/// `Set-Cookie` value with the session attributes used for every auth cookie.
pub(crate) fn build_cookie(
    name: &str,
    value: &str,
    max_age_seconds: u64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&format!(
        "{name}={value}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age={max_age_seconds}"
    ))
}

pub(crate) fn clear_cookie(name: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    build_cookie(name, "", 0)
}

enum Lookup {
    Live(SessionLookup),
    Expired,
    Missing,
}

pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    ttl: Duration,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a new session row and return the raw token for the cookie.
    ///
    /// # Errors
    /// `Internal` if the RNG or the expiry arithmetic fails, `StoreFailure`
    /// if the row cannot be written.
    pub async fn create_session(
        &self,
        user_id: Uuid,
        source: SessionSource,
    ) -> Result<IssuedSession, AuthError> {
        let token = generate_token()?;
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|err| AuthError::Internal(format!("session ttl out of range: {err}")))?;
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .ok_or_else(|| AuthError::Internal("session expiry overflow".to_string()))?;

        self.store
            .insert_session(&NewSession {
                token_hash: hash_session_token(&token),
                user_id,
                expires_at,
                source,
            })
            .await?;
        debug!("Created {source} session for {user_id}");

        Ok(IssuedSession {
            token,
            user_id,
            expires_at,
            source,
        })
    }

    /// `Set-Cookie` header carrying an issued session.
    ///
    /// # Errors
    /// `Internal` if the token cannot be encoded as a header value.
    pub fn session_cookie(&self, issued: &IssuedSession) -> Result<HeaderValue, AuthError> {
        build_cookie(
            cookie_name(issued.source),
            &issued.token,
            self.ttl.as_secs(),
        )
        .map_err(|err| AuthError::Internal(format!("invalid session cookie: {err}")))
    }

    async fn lookup(&self, token: &str) -> Result<Lookup, AuthError> {
        let now = Utc::now();
        Ok(match self.store.lookup_session(&hash_session_token(token)).await? {
            Some(row) if row.expires_at > now => Lookup::Live(row),
            Some(_) => Lookup::Expired,
            None => Lookup::Missing,
        })
    }

    /// Resolve the request's caller from its session credentials.
    ///
    /// # Errors
    /// `Unauthenticated` when no credential references a live row,
    /// `SessionExpired` when one referenced an expired row, `StoreFailure` on
    /// store errors and `UnknownRole` when a stored role is not recognized.
    pub async fn resolve_caller(&self, headers: &HeaderMap) -> Result<Caller, AuthError> {
        let mut saw_expired = false;

        let local = extract_cookie(headers, SESSION_COOKIE).or_else(|| extract_bearer_token(headers));
        if let Some(token) = local {
            match self.lookup(&token).await? {
                Lookup::Live(SessionLookup {
                    user_id,
                    role: Some(role),
                    source,
                    ..
                }) => {
                    return Ok(Caller {
                        user_id,
                        role: role.parse()?,
                        source,
                    });
                }
                Lookup::Expired => saw_expired = true,
                Lookup::Live(_) | Lookup::Missing => {}
            }
        }

        if let Some(token) = extract_cookie(headers, FEDERATED_COOKIE) {
            match self.lookup(&token).await? {
                Lookup::Live(row) => {
                    let role = match row.role {
                        Some(role) => role.parse()?,
                        None => Role::User,
                    };
                    return Ok(Caller {
                        user_id: row.user_id,
                        role,
                        source: row.source,
                    });
                }
                Lookup::Expired => saw_expired = true,
                Lookup::Missing => {}
            }
        }

        if saw_expired {
            Err(AuthError::SessionExpired)
        } else {
            Err(AuthError::Unauthenticated)
        }
    }

    /// Delete the rows behind both cookies and return clearing `Set-Cookie` values.
    ///
    /// # Errors
    /// `StoreFailure` if a row cannot be deleted.
    pub async fn destroy_session(&self, headers: &HeaderMap) -> Result<[HeaderValue; 2], AuthError> {
        for token in presented_tokens(headers) {
            self.store
                .delete_session(&hash_session_token(&token))
                .await?;
        }

        let clear = |name: &str| {
            clear_cookie(name)
                .map_err(|err| AuthError::Internal(format!("invalid clearing cookie: {err}")))
        };
        Ok([clear(SESSION_COOKIE)?, clear(FEDERATED_COOKIE)?])
    }

    /// Delete every session of `user_id` other than the ones this request
    /// presented, returning how many were revoked.
    ///
    /// # Errors
    /// `StoreFailure` if the delete fails.
    pub async fn revoke_other_sessions(
        &self,
        user_id: Uuid,
        headers: &HeaderMap,
    ) -> Result<u64, AuthError> {
        let keep: Vec<Vec<u8>> = presented_tokens(headers)
            .map(|token| hash_session_token(&token))
            .collect();
        Ok(self.store.delete_user_sessions(user_id, &keep).await?)
    }

    /// Delete all expired rows.
    ///
    /// # Errors
    /// `StoreFailure` if the delete fails.
    pub async fn sweep(&self) -> Result<u64, AuthError> {
        Ok(self.store.delete_expired_sessions(Utc::now()).await?)
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.sweep().await {
                    Ok(0) => {}
                    Ok(removed) => info!("Removed {removed} expired sessions"),
                    Err(err) => error!("Session sweep failed: {err}"),
                }
            }
        })
    }
}

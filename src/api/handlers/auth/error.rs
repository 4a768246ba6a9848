//! Identity and authorization failures and their HTTP mapping.

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::time::Duration;
use tracing::error;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no valid session")]
    Unauthenticated,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("too many attempts, locked for {}s", retry_after_seconds(*remaining))]
    RateLimited { remaining: Duration },
    #[error("insufficient role")]
    Forbidden,
    #[error("session expired")]
    SessionExpired,
    #[error("credential store failure: {0}")]
    StoreFailure(#[from] StoreError),
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated | Self::InvalidCredentials | Self::SessionExpired => {
                StatusCode::UNAUTHORIZED
            }
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::StoreFailure(_) | Self::UnknownRole(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Whole seconds left in a lockout, rounded up so a client never retries early.
#[must_use]
pub fn retry_after_seconds(remaining: Duration) -> u64 {
    let seconds = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    seconds.max(1)
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::Unauthenticated => (status, "Authentication required").into_response(),
            Self::InvalidCredentials => (status, "Invalid credentials").into_response(),
            Self::SessionExpired => (status, "Session expired").into_response(),
            Self::Forbidden => (status, "Forbidden").into_response(),
            Self::RateLimited { remaining } => {
                let seconds = retry_after_seconds(remaining);
                let mut response = (
                    status,
                    format!("Too many attempts. Retry in {seconds} seconds."),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(seconds));
                response
            }
            Self::StoreFailure(err) => {
                error!("Credential store failure: {err}");
                (status, "Internal server error").into_response()
            }
            Self::UnknownRole(name) => {
                error!("Unknown role in credential store: {name}");
                (status, "Internal server error").into_response()
            }
            Self::Internal(message) => {
                error!("Internal auth error: {message}");
                (status, "Internal server error").into_response()
            }
        }
    }
}

//! Argon2 password hashing and credential verification.
//!
//! Both operations are CPU-bound and run on the blocking pool.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use std::sync::OnceLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{error::AuthError, utils::normalize_email};
use crate::store::CredentialStore;

pub const MIN_PASSWORD_LEN: usize = 8;

/// Hash a password into a PHC string.
///
/// # Errors
/// `Internal` if hashing fails or the blocking task panics.
pub async fn hash_password(password: String) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| AuthError::Internal(format!("failed to hash password: {err}")))
    })
    .await
    .map_err(|err| AuthError::Internal(format!("password hashing task failed: {err}")))?
}

/// PHC hash of a throwaway password, checked against when there is no real
/// hash so every login attempt pays for one Argon2 verification.
fn dummy_hash() -> Option<&'static str> {
    static DUMMY: OnceLock<Option<String>> = OnceLock::new();
    DUMMY
        .get_or_init(|| {
            let salt = SaltString::generate(&mut OsRng);
            Argon2::default()
                .hash_password(b"pordisto-no-such-account", &salt)
                .ok()
                .map(|hash| hash.to_string())
        })
        .as_deref()
}

async fn burn_verification(candidate: String) -> Result<(), AuthError> {
    tokio::task::spawn_blocking(move || {
        if let Some(parsed) = dummy_hash().and_then(|phc| PasswordHash::new(phc).ok()) {
            let _ = Argon2::default().verify_password(candidate.as_bytes(), &parsed);
        }
    })
    .await
    .map_err(|err| AuthError::Internal(format!("password verification task failed: {err}")))
}

async fn password_matches(phc: String, candidate: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&phc)
            .map_err(|err| AuthError::Internal(format!("stored password hash is invalid: {err}")))?;
        Ok(Argon2::default()
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|err| AuthError::Internal(format!("password verification task failed: {err}")))?
}

/// Check an email/password pair against the store.
///
/// Unknown emails, accounts without a password and mismatches all fail with
/// the same `InvalidCredentials` after one Argon2 verification, so neither
/// the response nor its timing reveals which.
///
/// # Errors
/// `InvalidCredentials`, or `StoreFailure`/`Internal` for faults.
#[instrument(skip_all)]
pub async fn verify_password(
    store: &dyn CredentialStore,
    email: &str,
    candidate: &str,
) -> Result<Uuid, AuthError> {
    let Some(user) = store.find_user_by_email(&normalize_email(email)).await? else {
        debug!("Login for unknown email");
        burn_verification(candidate.to_string()).await?;
        return Err(AuthError::InvalidCredentials);
    };
    let Some(phc) = user.password_hash else {
        debug!("Password login for federated-only account");
        burn_verification(candidate.to_string()).await?;
        return Err(AuthError::InvalidCredentials);
    };
    if password_matches(phc, candidate.to_string()).await? {
        Ok(user.id)
    } else {
        Err(AuthError::InvalidCredentials)
    }
}

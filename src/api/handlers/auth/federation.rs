//! Map a verified external email to a local user, creating one on first sight.

use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{error::AuthError, role::Role, utils::normalize_email};
use crate::store::{CredentialStore, NewUser, StoreError};

pub struct IdentityFederator {
    store: Arc<dyn CredentialStore>,
}

impl IdentityFederator {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Find or create the user for `verified_email`. Idempotent: concurrent
    /// first logins for the same email converge on one row.
    ///
    /// # Errors
    /// `Unauthenticated` for an empty email, `StoreFailure` on store errors.
    #[instrument(skip_all)]
    pub async fn resolve_external_identity(&self, verified_email: &str) -> Result<Uuid, AuthError> {
        let email = normalize_email(verified_email);
        if email.is_empty() {
            return Err(AuthError::Unauthenticated);
        }
        if let Some(user) = self.store.find_user_by_email(&email).await? {
            return Ok(user.id);
        }

        let user = NewUser {
            id: Uuid::new_v4(),
            username: email.clone(),
            email,
            password_hash: None,
            role: Role::User.as_str().to_string(),
        };
        match self.store.insert_user(&user).await {
            Ok(()) => {
                info!("Created federated account {}", user.id);
                Ok(user.id)
            }
            Err(StoreError::UniqueViolation) => self
                .store
                .find_user_by_email(&user.email)
                .await?
                .map(|existing| existing.id)
                .ok_or(AuthError::StoreFailure(StoreError::NotFound)),
            Err(err) => Err(err.into()),
        }
    }
}

//! Self-service edits of the signed-in user's own account.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Form,
};
use std::sync::Arc;
use tracing::info;

use super::{
    error::AuthError,
    login::{MAX_USERNAME_LEN, PASSWORD_RULE, USERNAME_RULE},
    password::{hash_password, MIN_PASSWORD_LEN},
    session::Caller,
    state::AuthState,
    types::AccountUpdateForm,
    utils::{normalize_email, valid_email},
};
use crate::store::{StoreError, UserUpdate};

/// Validated changes plus the new plaintext password, which still needs hashing.
fn validate_update(form: &AccountUpdateForm) -> Result<(UserUpdate, Option<String>), &'static str> {
    let email = form
        .email
        .as_deref()
        .map(normalize_email)
        .filter(|email| !email.is_empty());
    if email.as_deref().is_some_and(|email| !valid_email(email)) {
        return Err("Invalid email");
    }

    let username = form
        .username
        .as_deref()
        .map(str::trim)
        .filter(|username| !username.is_empty());
    if username.is_some_and(|username| username.chars().count() > MAX_USERNAME_LEN) {
        return Err(USERNAME_RULE);
    }

    let password = form
        .password
        .clone()
        .filter(|password| !password.is_empty());
    if password
        .as_ref()
        .is_some_and(|password| password.chars().count() < MIN_PASSWORD_LEN)
    {
        return Err(PASSWORD_RULE);
    }

    if email.is_none() && username.is_none() && password.is_none() {
        return Err("No changes submitted");
    }
    Ok((
        UserUpdate {
            email,
            username: username.map(str::to_string),
            password_hash: None,
        },
        password,
    ))
}

#[utoipa::path(
    post,
    path = "/v1/account",
    request_body(content = AccountUpdateForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 204, description = "Account updated; a new password signs out other sessions"),
        (status = 400, description = "Invalid email, username or password, or nothing to change"),
        (status = 401, description = "No active session"),
        (status = 409, description = "Email already taken")
    ),
    tag = "auth"
)]
pub async fn update_account(
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
    Extension(caller): Extension<Caller>,
    Form(form): Form<AccountUpdateForm>,
) -> Result<Response, AuthError> {
    let (mut update, password) = match validate_update(&form) {
        Ok(valid) => valid,
        Err(message) => return Ok((StatusCode::BAD_REQUEST, message).into_response()),
    };
    let password_changed = password.is_some();
    if let Some(password) = password {
        update.password_hash = Some(hash_password(password).await?);
    }

    match auth_state.store().update_user(caller.user_id, &update).await {
        Ok(()) => {}
        Err(StoreError::UniqueViolation) => {
            return Ok((StatusCode::CONFLICT, "Email already taken").into_response());
        }
        Err(StoreError::NotFound) => return Err(AuthError::Unauthenticated),
        Err(err) => return Err(err.into()),
    }

    if password_changed {
        let revoked = auth_state
            .sessions()
            .revoke_other_sessions(caller.user_id, &headers)
            .await?;
        info!(
            "User {} changed their password, {revoked} other sessions revoked",
            caller.user_id
        );
    } else {
        info!("User {} updated their account", caller.user_id);
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

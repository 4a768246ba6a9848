//! Registration, password login, logout and session check endpoints.

use axum::{
    extract::{ConnectInfo, Extension},
    http::{
        header::{LOCATION, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Form, Json,
};
use std::{net::SocketAddr, sync::Arc};
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    error::AuthError,
    password::{hash_password, MIN_PASSWORD_LEN},
    role::Role,
    state::AuthState,
    types::{LoginForm, RegisterForm, SessionResponse},
    utils::{client_identifier, normalize_email, valid_email},
};
use crate::store::{NewUser, StoreError};

pub(super) const MAX_USERNAME_LEN: usize = 64;
pub(super) const USERNAME_RULE: &str = "Username must be between 1 and 64 characters";
pub(super) const PASSWORD_RULE: &str = "Password must be at least 8 characters";

fn redirect(location: &'static str, cookies: &[HeaderValue]) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(LOCATION, HeaderValue::from_static(location));
    for cookie in cookies {
        headers.append(SET_COOKIE, cookie.clone());
    }
    (StatusCode::SEE_OTHER, headers).into_response()
}

fn validate_registration(form: &RegisterForm) -> Result<(String, String), &'static str> {
    let email = normalize_email(&form.email);
    if !valid_email(&email) {
        return Err("Invalid email");
    }
    let username = form.username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN {
        return Err(USERNAME_RULE);
    }
    if form.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(PASSWORD_RULE);
    }
    Ok((email, username.to_string()))
}

#[utoipa::path(
    post,
    path = "/register",
    request_body(content = RegisterForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 303, description = "Account created; redirect to /login"),
        (status = 400, description = "Invalid email, username or password"),
        (status = 409, description = "Email already taken"),
        (status = 429, description = "Too many requests")
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn register(
    Extension(auth_state): Extension<Arc<AuthState>>,
    Form(form): Form<RegisterForm>,
) -> Result<Response, AuthError> {
    let (email, username) = match validate_registration(&form) {
        Ok(valid) => valid,
        Err(message) => return Ok((StatusCode::BAD_REQUEST, message).into_response()),
    };
    let password_hash = hash_password(form.password).await?;

    let user = NewUser {
        id: Uuid::new_v4(),
        email,
        username,
        password_hash: Some(password_hash),
        role: Role::User.as_str().to_string(),
    };
    match auth_state.store().insert_user(&user).await {
        Ok(()) => {
            info!("Registered user {}", user.id);
            Ok(redirect("/login", &[]))
        }
        Err(StoreError::UniqueViolation) => {
            Ok((StatusCode::CONFLICT, "Email already taken").into_response())
        }
        Err(err) => Err(err.into()),
    }
}

#[utoipa::path(
    post,
    path = "/login",
    request_body(content = LoginForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 303, description = "Signed in; session cookie set, redirect to /forum"),
        (status = 401, description = "Invalid credentials"),
        (status = 429, description = "Client is locked out")
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn login(
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
    Form(form): Form<LoginForm>,
) -> Result<Response, AuthError> {
    let client = client_identifier(
        &headers,
        peer.map(|ConnectInfo(addr)| addr),
        auth_state.config().trusted_proxies(),
    );
    let issued = auth_state
        .password_login(&client, &form.email, &form.password)
        .await?;
    let cookie = auth_state.sessions().session_cookie(&issued)?;
    Ok(redirect("/forum", &[cookie]))
}

#[utoipa::path(
    post,
    path = "/logout",
    responses(
        (status = 303, description = "Session cleared; redirect to /")
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
) -> Result<Response, AuthError> {
    let cleared = auth_state.sessions().destroy_session(&headers).await?;
    Ok(redirect("/", &cleared))
}

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    responses(
        (status = 200, description = "Session is active", body = SessionResponse),
        (status = 401, description = "No active session")
    ),
    tag = "auth"
)]
pub async fn session(
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
) -> Result<Json<SessionResponse>, AuthError> {
    let caller = auth_state.sessions().resolve_caller(&headers).await?;
    Ok(Json(SessionResponse {
        user_id: caller.user_id.to_string(),
        role: caller.role,
        source: caller.source.to_string(),
    }))
}

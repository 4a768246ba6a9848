//! Router-level auth tests against the in-memory store.

use super::{
    password::hash_password,
    session::{FEDERATED_COOKIE, SESSION_COOKIE},
    utils::hash_session_token,
    AuthConfig, AuthError, AuthState, NoopRateLimiter, OAuthClient, OAuthConfig,
    ProviderCredentials, RateLimiter, Role, SlidingWindowRateLimiter,
};
use crate::store::{
    CredentialStore, MemoryStore, NewSession, NewUser, PendingPromotion, SessionLookup,
    SessionSource, StoreError, StoreResult, UserRecord, UserSummary, UserUpdate,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    extract::ConnectInfo,
    http::{
        header::{CONTENT_TYPE, COOKIE, LOCATION, RETRY_AFTER, SET_COOKIE},
        Request, Response, StatusCode,
    },
    Router,
};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinSet;
use tower::ServiceExt;
use uuid::Uuid;

const CLIENT_IP: &str = "10.0.0.1";
const PASSWORD: &str = "correct horse battery";

struct Harness {
    store: Arc<MemoryStore>,
    state: Arc<AuthState>,
    app: Router,
}

fn oauth_client(config: &AuthConfig) -> Result<OAuthClient> {
    let github = ProviderCredentials::new(
        "gh-id".to_string(),
        SecretString::from("gh-secret".to_string()),
    );
    Ok(OAuthClient::new(
        OAuthConfig::default().with_github(github),
        config.public_base_url(),
    )?)
}

fn test_config() -> AuthConfig {
    AuthConfig::new("https://forum.example".to_string()).with_login_failure_delay(Duration::ZERO)
}

fn harness_with(limiter: Arc<dyn RateLimiter>) -> Result<Harness> {
    harness_from(test_config(), limiter)
}

fn harness_from(config: AuthConfig, limiter: Arc<dyn RateLimiter>) -> Result<Harness> {
    let store = Arc::new(MemoryStore::new());
    let oauth = oauth_client(&config)?;
    let state = Arc::new(AuthState::new(config, store.clone(), limiter, oauth));
    Ok(Harness {
        app: crate::api::router(state.clone()),
        store,
        state,
    })
}

fn harness() -> Result<Harness> {
    harness_with(Arc::new(NoopRateLimiter))
}

async fn seed_user(store: &MemoryStore, email: &str, role: Role) -> Result<Uuid> {
    let id = Uuid::new_v4();
    store
        .insert_user(&NewUser {
            id,
            email: email.to_string(),
            username: email.split('@').next().unwrap_or(email).to_string(),
            password_hash: Some(hash_password(PASSWORD.to_string()).await?),
            role: role.as_str().to_string(),
        })
        .await?;
    Ok(id)
}

async fn session_cookie(state: &AuthState, user_id: Uuid) -> Result<String> {
    let issued = state
        .sessions()
        .create_session(user_id, SessionSource::Password)
        .await?;
    Ok(format!("{SESSION_COOKIE}={}", issued.token))
}

fn peer(ip: &str) -> Result<ConnectInfo<SocketAddr>> {
    Ok(ConnectInfo(SocketAddr::new(ip.parse()?, 40_000)))
}

fn form_post_from(uri: &str, body: String, from: &str) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .extension(peer(from)?)
        .body(Body::from(body))?)
}

fn form_post(uri: &str, body: String) -> Result<Request<Body>> {
    form_post_from(uri, body, CLIENT_IP)
}

fn login_request(email: &str, password: &str) -> Result<Request<Body>> {
    form_post(
        "/login",
        format!("email={email}&password={}", password.replace(' ', "+")),
    )
}

fn get_with_cookie(uri: &str, cookie: Option<&str>) -> Result<Request<Body>> {
    let mut builder = Request::builder().uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(COOKIE, cookie);
    }
    Ok(builder.body(Body::empty())?)
}

fn json_post(uri: &str, cookie: &str, body: &serde_json::Value) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .header(COOKIE, cookie)
        .body(Body::from(body.to_string()))?)
}

async fn body_text(response: Response<Body>) -> Result<String> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn session_token(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .find_map(|pair| pair.strip_prefix(&format!("{SESSION_COOKIE}=")))
        .map(str::to_string)
}

#[tokio::test]
async fn sixth_failure_locks_client_and_blocks_correct_password() -> Result<()> {
    let harness = harness()?;
    seed_user(&harness.store, "alice@example.com", Role::User).await?;

    for _ in 0..5 {
        let response = harness
            .app
            .clone()
            .oneshot(login_request("alice@example.com", "wrong password")?)
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_text(response).await?, "Invalid credentials");
    }

    let response = harness
        .app
        .clone()
        .oneshot(login_request("alice@example.com", "wrong password")?)
        .await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
        Some("30")
    );
    assert_eq!(
        body_text(response).await?,
        "Too many attempts. Retry in 30 seconds."
    );

    let response = harness
        .app
        .clone()
        .oneshot(login_request("alice@example.com", PASSWORD)?)
        .await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(session_token(&response).is_none());
    assert_eq!(harness.store.session_count(), 0);
    assert_eq!(harness.state.throttle().failures(CLIENT_IP), 6);
    Ok(())
}

#[tokio::test]
async fn rotating_forwarded_header_does_not_escape_lockout() -> Result<()> {
    let harness = harness()?;
    seed_user(&harness.store, "alice@example.com", Role::User).await?;

    let mut statuses = Vec::new();
    for i in 0..8 {
        let mut request = login_request("alice@example.com", "wrong password")?;
        request
            .headers_mut()
            .insert("x-forwarded-for", format!("198.51.100.{i}").parse()?);
        statuses.push(harness.app.clone().oneshot(request).await?.status());
    }
    assert_eq!(statuses[..5], [StatusCode::UNAUTHORIZED; 5]);
    assert_eq!(statuses[5..], [StatusCode::TOO_MANY_REQUESTS; 3]);
    assert_eq!(harness.state.throttle().failures(CLIENT_IP), 6);
    assert_eq!(harness.state.throttle().failures("198.51.100.0"), 0);
    Ok(())
}

#[tokio::test]
async fn forwarded_client_is_used_behind_trusted_proxy() -> Result<()> {
    let proxy: IpAddr = "10.0.0.2".parse()?;
    let harness = harness_from(
        test_config().with_trusted_proxies(vec![proxy]),
        Arc::new(NoopRateLimiter),
    )?;
    seed_user(&harness.store, "alice@example.com", Role::User).await?;

    for client in ["198.51.100.1", "198.51.100.2"] {
        let mut request = form_post_from(
            "/login",
            "email=alice@example.com&password=nope".to_string(),
            "10.0.0.2",
        )?;
        request
            .headers_mut()
            .insert("x-forwarded-for", format!("203.0.113.77, {client}").parse()?);
        let response = harness.app.clone().oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    assert_eq!(harness.state.throttle().failures("198.51.100.1"), 1);
    assert_eq!(harness.state.throttle().failures("198.51.100.2"), 1);
    assert_eq!(harness.state.throttle().failures("10.0.0.2"), 0);
    assert_eq!(harness.state.throttle().failures("203.0.113.77"), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_guesses_share_the_failure_budget() -> Result<()> {
    let harness = harness_from(
        test_config().with_login_failure_delay(Duration::from_millis(300)),
        Arc::new(NoopRateLimiter),
    )?;
    seed_user(&harness.store, "alice@example.com", Role::User).await?;

    for _ in 0..5 {
        let result = harness
            .state
            .password_login(CLIENT_IP, "alice@example.com", "wrong password")
            .await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }

    let mut attempts = JoinSet::new();
    for i in 0..10 {
        let state = harness.state.clone();
        attempts.spawn(async move {
            let password = if i == 9 { PASSWORD } else { "wrong password" };
            state
                .password_login(CLIENT_IP, "alice@example.com", password)
                .await
        });
    }

    let mut locked = 0;
    while let Some(result) = attempts.join_next().await {
        match result? {
            Ok(_) => return Err(anyhow!("a guess got past the lockout")),
            Err(AuthError::RateLimited { .. }) => locked += 1,
            Err(err) => return Err(anyhow!("unexpected error: {err}")),
        }
    }
    assert_eq!(locked, 10);
    assert_eq!(harness.store.session_count(), 0);
    assert_eq!(harness.state.throttle().failures(CLIENT_IP), 6);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failure_delay_applies_to_failures_only() -> Result<()> {
    let delay = Duration::from_secs(4);
    let harness = harness_from(
        test_config().with_login_failure_delay(delay),
        Arc::new(NoopRateLimiter),
    )?;
    seed_user(&harness.store, "alice@example.com", Role::User).await?;

    let started = tokio::time::Instant::now();
    let result = harness
        .state
        .password_login(CLIENT_IP, "alice@example.com", "wrong password")
        .await;
    assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    assert!(started.elapsed() >= delay);

    let started = tokio::time::Instant::now();
    let result = harness
        .state
        .password_login(CLIENT_IP, "nobody@example.com", PASSWORD)
        .await;
    assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    assert!(started.elapsed() >= delay);

    let started = tokio::time::Instant::now();
    harness
        .state
        .password_login(CLIENT_IP, "alice@example.com", PASSWORD)
        .await?;
    assert!(started.elapsed() < delay);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failure_delay_applies_to_store_faults() -> Result<()> {
    let delay = Duration::from_secs(4);
    let state = failing_state(test_config().with_login_failure_delay(delay))?;

    let started = tokio::time::Instant::now();
    let result = state
        .password_login(CLIENT_IP, "alice@example.com", PASSWORD)
        .await;
    assert!(matches!(result, Err(AuthError::StoreFailure(_))));
    assert!(started.elapsed() >= delay);
    assert_eq!(state.throttle().failures(CLIENT_IP), 0);
    Ok(())
}

#[tokio::test]
async fn unknown_email_and_wrong_password_look_alike() -> Result<()> {
    let harness = harness()?;
    seed_user(&harness.store, "bob@example.com", Role::User).await?;

    let unknown = harness
        .app
        .clone()
        .oneshot(login_request("nobody@example.com", PASSWORD)?)
        .await?;
    let wrong = harness
        .app
        .clone()
        .oneshot(login_request("bob@example.com", "not it at all")?)
        .await?;
    assert_eq!(unknown.status(), wrong.status());
    assert_eq!(body_text(unknown).await?, body_text(wrong).await?);
    Ok(())
}

#[tokio::test]
async fn successful_login_issues_day_long_session_and_clears_failures() -> Result<()> {
    let harness = harness()?;
    let user_id = seed_user(&harness.store, "carol@example.com", Role::User).await?;

    for _ in 0..3 {
        harness
            .app
            .clone()
            .oneshot(login_request("carol@example.com", "wrong password")?)
            .await?;
    }
    assert_eq!(harness.state.throttle().failures(CLIENT_IP), 3);

    let before = Utc::now();
    let response = harness
        .app
        .clone()
        .oneshot(login_request("Carol@Example.com", PASSWORD)?)
        .await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers().get(LOCATION).and_then(|v| v.to_str().ok()),
        Some("/forum")
    );
    let cookie_header = response
        .headers()
        .get(SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(cookie_header.contains("HttpOnly"));
    assert!(cookie_header.contains("SameSite=Strict"));
    assert!(cookie_header.ends_with("Max-Age=86400"));

    let token = session_token(&response).ok_or_else(|| anyhow!("no session cookie"))?;
    let expires_at: DateTime<Utc> = harness
        .store
        .session_expiry(&hash_session_token(&token))
        .ok_or_else(|| anyhow!("session row missing"))?;
    let lifetime = expires_at - before;
    assert!(lifetime >= chrono::Duration::hours(24));
    assert!(lifetime < chrono::Duration::hours(24) + chrono::Duration::seconds(5));
    assert_eq!(harness.state.throttle().failures(CLIENT_IP), 0);

    let caller = harness
        .app
        .clone()
        .oneshot(get_with_cookie(
            "/v1/auth/session",
            Some(&format!("{SESSION_COOKIE}={token}")),
        )?)
        .await?;
    assert_eq!(caller.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_text(caller).await?)?;
    assert_eq!(body["user_id"], user_id.to_string());
    assert_eq!(body["role"], "user");
    assert_eq!(body["source"], "password");
    Ok(())
}

#[tokio::test]
async fn session_endpoint_requires_a_session() -> Result<()> {
    let harness = harness()?;
    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/v1/auth/session", None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie(
            "/v1/auth/session",
            Some(&format!("{SESSION_COOKIE}=forged")),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn require_role_moderator_checks_hierarchy() -> Result<()> {
    let harness = harness()?;
    let admin = seed_user(&harness.store, "admin@example.com", Role::Admin).await?;
    let user = seed_user(&harness.store, "user@example.com", Role::User).await?;
    let app = super::require_role(
        harness.state.clone(),
        Role::Moderator,
        Router::new().route("/mod", axum::routing::get(|| async { "ok" })),
    );

    let admin_cookie = session_cookie(&harness.state, admin).await?;
    let response = app
        .clone()
        .oneshot(get_with_cookie("/mod", Some(&admin_cookie))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let user_cookie = session_cookie(&harness.state, user).await?;
    let response = app
        .clone()
        .oneshot(get_with_cookie("/mod", Some(&user_cookie))?)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.oneshot(get_with_cookie("/mod", None)?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn federated_cookie_grants_access() -> Result<()> {
    let harness = harness()?;
    let user_id = harness
        .state
        .federator()
        .resolve_external_identity("fed@example.com")
        .await?;
    let issued = harness
        .state
        .sessions()
        .create_session(user_id, SessionSource::Federated)
        .await?;

    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie(
            "/v1/auth/session",
            Some(&format!("{FEDERATED_COOKIE}={}", issued.token)),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await?)?;
    assert_eq!(body["source"], "federated");
    assert_eq!(body["role"], "user");
    Ok(())
}

#[tokio::test]
async fn register_creates_account_once() -> Result<()> {
    let harness = harness()?;
    let body = || "email=dave%40example.com&username=dave&password=longenough".to_string();

    let response = harness
        .app
        .clone()
        .oneshot(form_post("/register", body())?)
        .await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers().get(LOCATION).and_then(|v| v.to_str().ok()),
        Some("/login")
    );
    assert_eq!(harness.store.user_count(), 1);

    let response = harness
        .app
        .clone()
        .oneshot(form_post("/register", body())?)
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_text(response).await?, "Email already taken");

    let response = harness
        .app
        .clone()
        .oneshot(form_post(
            "/register",
            "email=eve%40example.com&username=eve&password=short".to_string(),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(harness.store.user_count(), 1);
    Ok(())
}

fn account_post(cookie: Option<&str>, body: &str) -> Result<Request<Body>> {
    let mut request = form_post("/v1/account", body.to_string())?;
    if let Some(cookie) = cookie {
        request.headers_mut().insert(COOKIE, cookie.parse()?);
    }
    Ok(request)
}

#[tokio::test]
async fn account_update_changes_profile_and_password() -> Result<()> {
    let harness = harness()?;
    let alice = seed_user(&harness.store, "alice@example.com", Role::User).await?;
    seed_user(&harness.store, "bob@example.com", Role::User).await?;
    let current = session_cookie(&harness.state, alice).await?;
    let elsewhere = session_cookie(&harness.state, alice).await?;

    let response = harness
        .app
        .clone()
        .oneshot(account_post(None, "username=mallory")?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = harness
        .app
        .clone()
        .oneshot(account_post(Some(&current), "email=Bob%40Example.com")?)
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_text(response).await?, "Email already taken");

    let response = harness
        .app
        .clone()
        .oneshot(account_post(Some(&current), "email=not-an-email")?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = harness
        .app
        .clone()
        .oneshot(account_post(
            Some(&current),
            "username=alice2&email=&password=brand+new+secret",
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let user = harness
        .store
        .find_user_by_id(alice)
        .await?
        .ok_or_else(|| anyhow!("user missing"))?;
    assert_eq!(user.username, "alice2");
    assert_eq!(user.email, "alice@example.com");

    // The session that made the change survives; the other one is revoked.
    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/v1/auth/session", Some(&current))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/v1/auth/session", Some(&elsewhere))?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = harness
        .app
        .clone()
        .oneshot(login_request("alice@example.com", PASSWORD)?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = harness
        .app
        .clone()
        .oneshot(login_request("alice@example.com", "brand new secret")?)
        .await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    Ok(())
}

#[tokio::test]
async fn account_update_without_password_keeps_other_sessions() -> Result<()> {
    let harness = harness()?;
    let alice = seed_user(&harness.store, "alice@example.com", Role::User).await?;
    let current = session_cookie(&harness.state, alice).await?;
    let elsewhere = session_cookie(&harness.state, alice).await?;

    let response = harness
        .app
        .clone()
        .oneshot(account_post(Some(&current), "email=Alice.New%40Example.com")?)
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(harness.store.session_count(), 2);
    assert!(harness
        .store
        .find_user_by_email("alice.new@example.com")
        .await?
        .is_some_and(|user| user.id == alice));

    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/v1/auth/session", Some(&elsewhere))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = harness
        .app
        .clone()
        .oneshot(account_post(Some(&current), "username=&email=&password=")?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await?, "No changes submitted");
    Ok(())
}

#[tokio::test]
async fn logout_destroys_session_and_clears_cookies() -> Result<()> {
    let harness = harness()?;
    let user = seed_user(&harness.store, "frank@example.com", Role::User).await?;
    let cookie = session_cookie(&harness.state, user).await?;
    assert_eq!(harness.store.session_count(), 1);

    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/logout")
                .header(COOKIE, &cookie)
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers().get(LOCATION).and_then(|v| v.to_str().ok()),
        Some("/")
    );
    assert_eq!(response.headers().get_all(SET_COOKIE).iter().count(), 2);
    assert_eq!(harness.store.session_count(), 0);

    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/v1/auth/session", Some(&cookie))?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn request_limiter_rejects_request_over_limit() -> Result<()> {
    let harness = harness_with(Arc::new(SlidingWindowRateLimiter::new(
        2,
        Duration::from_secs(60),
    )))?;

    for _ in 0..2 {
        let response = harness
            .app
            .clone()
            .oneshot(login_request("ghost@example.com", PASSWORD)?)
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    let response = harness
        .app
        .clone()
        .oneshot(login_request("ghost@example.com", PASSWORD)?)
        .await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_text(response).await?, "Too many requests");
    // The limiter answered before the credential check.
    assert_eq!(harness.state.throttle().failures(CLIENT_IP), 2);
    Ok(())
}

#[tokio::test]
async fn promotion_request_approval_flow() -> Result<()> {
    let harness = harness()?;
    let admin = seed_user(&harness.store, "root@example.com", Role::Admin).await?;
    let member = seed_user(&harness.store, "grace@example.com", Role::User).await?;
    let admin_cookie = session_cookie(&harness.state, admin).await?;
    let member_cookie = session_cookie(&harness.state, member).await?;

    let response = harness
        .app
        .clone()
        .oneshot(json_post(
            "/v1/moderation/requests",
            &member_cookie,
            &serde_json::json!({}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: serde_json::Value = serde_json::from_str(&body_text(response).await?)?;
    let request_id = created["id"]
        .as_i64()
        .ok_or_else(|| anyhow!("missing request id"))?;

    let response = harness
        .app
        .clone()
        .oneshot(json_post(
            "/v1/moderation/requests",
            &member_cookie,
            &serde_json::json!({}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Members cannot see or decide requests.
    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/v1/moderation/requests", Some(&member_cookie))?)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/v1/moderation/requests", Some(&admin_cookie))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let pending: serde_json::Value = serde_json::from_str(&body_text(response).await?)?;
    assert_eq!(pending[0]["username"], "grace");
    assert_eq!(pending[0]["user_id"], member.to_string());

    let decision = serde_json::json!({ "request_id": request_id });
    let response = harness
        .app
        .clone()
        .oneshot(json_post(
            "/v1/moderation/requests/approve",
            &admin_cookie,
            &decision,
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        harness.store.promotion_status(request_id),
        Some(("approved".to_string(), Some(admin)))
    );

    let response = harness
        .app
        .clone()
        .oneshot(json_post(
            "/v1/moderation/requests/approve",
            &admin_cookie,
            &decision,
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // The member's existing session now carries the new role.
    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/v1/moderation/moderators", Some(&admin_cookie))?)
        .await?;
    let moderators: serde_json::Value = serde_json::from_str(&body_text(response).await?)?;
    assert_eq!(moderators[0]["user_id"], member.to_string());
    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/v1/auth/session", Some(&member_cookie))?)
        .await?;
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await?)?;
    assert_eq!(body["role"], "moderator");

    let response = harness
        .app
        .clone()
        .oneshot(json_post(
            "/v1/moderation/moderators/remove",
            &admin_cookie,
            &serde_json::json!({ "user_id": member.to_string() }),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let demoted = harness.store.find_user_by_id(member).await?;
    assert_eq!(demoted.map(|user| user.role), Some("user".to_string()));
    Ok(())
}

#[tokio::test]
async fn moderators_and_admins_cannot_request_promotion() -> Result<()> {
    let harness = harness()?;
    for (email, role) in [
        ("mod@example.com", Role::Moderator),
        ("boss@example.com", Role::Admin),
    ] {
        let user_id = seed_user(&harness.store, email, role).await?;
        let cookie = session_cookie(&harness.state, user_id).await?;
        let response = harness
            .app
            .clone()
            .oneshot(json_post(
                "/v1/moderation/requests",
                &cookie,
                &serde_json::json!({}),
            )?)
            .await?;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_text(response).await?, "Already a moderator");
    }
    assert!(harness.store.list_pending_promotions().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn approving_request_of_missing_user_changes_nothing() -> Result<()> {
    let harness = harness()?;
    let admin = seed_user(&harness.store, "root@example.com", Role::Admin).await?;
    let member = seed_user(&harness.store, "henry@example.com", Role::User).await?;
    let admin_cookie = session_cookie(&harness.state, admin).await?;
    let request_id = harness.store.insert_promotion_request(member).await?;
    harness.store.remove_user(member);

    let response = harness
        .app
        .clone()
        .oneshot(json_post(
            "/v1/moderation/requests/approve",
            &admin_cookie,
            &serde_json::json!({ "request_id": request_id }),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        harness.store.promotion_status(request_id),
        Some(("pending".to_string(), None))
    );
    Ok(())
}

#[tokio::test]
async fn set_role_validates_input() -> Result<()> {
    let harness = harness()?;
    let admin = seed_user(&harness.store, "root@example.com", Role::Admin).await?;
    let member = seed_user(&harness.store, "ivy@example.com", Role::User).await?;
    let admin_cookie = session_cookie(&harness.state, admin).await?;

    let cases = [
        (member.to_string(), "owner", StatusCode::BAD_REQUEST),
        ("not-a-uuid".to_string(), "moderator", StatusCode::BAD_REQUEST),
        (Uuid::new_v4().to_string(), "moderator", StatusCode::NOT_FOUND),
        (member.to_string(), "moderator", StatusCode::NO_CONTENT),
    ];
    for (user_id, role, expected) in cases {
        let response = harness
            .app
            .clone()
            .oneshot(json_post(
                "/v1/users/role",
                &admin_cookie,
                &serde_json::json!({ "user_id": user_id, "role": role }),
            )?)
            .await?;
        assert_eq!(response.status(), expected, "{user_id} -> {role}");
    }
    let updated = harness.store.find_user_by_id(member).await?;
    assert_eq!(updated.map(|user| user.role), Some("moderator".to_string()));
    Ok(())
}

#[tokio::test]
async fn oauth_start_redirects_to_configured_provider() -> Result<()> {
    let harness = harness()?;

    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/auth/github", None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(location.starts_with("https://github.com/login/oauth/authorize"));
    assert!(location.contains("client_id=gh-id"));
    assert!(response
        .headers()
        .get(SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|cookie| cookie.starts_with("pordisto_oauth_state=")));

    // Google has no credentials in this harness.
    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/auth/google", None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/auth/myspace", None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn oauth_callback_rejects_state_mismatch() -> Result<()> {
    let harness = harness()?;

    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie(
            "/auth/callback/github?code=abc&state=attacker",
            Some("pordisto_oauth_state=expected"),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie(
            "/auth/callback/github?code=abc&state=expected",
            None,
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie(
            "/auth/callback/github?state=expected",
            Some("pordisto_oauth_state=expected"),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(harness.store.user_count(), 0);
    Ok(())
}

/// Store whose every call fails, standing in for an unreachable database.
struct FailingStore;

fn down<T>() -> StoreResult<T> {
    Err(StoreError::Unavailable("connection refused".to_string()))
}

#[async_trait]
impl CredentialStore for FailingStore {
    async fn ping(&self) -> StoreResult<()> {
        down()
    }
    async fn find_user_by_email(&self, _email: &str) -> StoreResult<Option<UserRecord>> {
        down()
    }
    async fn find_user_by_id(&self, _id: Uuid) -> StoreResult<Option<UserRecord>> {
        down()
    }
    async fn insert_user(&self, _user: &NewUser) -> StoreResult<()> {
        down()
    }
    async fn set_user_role(&self, _id: Uuid, _role: &str) -> StoreResult<()> {
        down()
    }
    async fn update_user(&self, _id: Uuid, _update: &UserUpdate) -> StoreResult<()> {
        down()
    }
    async fn list_users_with_role(&self, _role: &str) -> StoreResult<Vec<UserSummary>> {
        down()
    }
    async fn insert_session(&self, _session: &NewSession) -> StoreResult<()> {
        down()
    }
    async fn lookup_session(&self, _token_hash: &[u8]) -> StoreResult<Option<SessionLookup>> {
        down()
    }
    async fn delete_session(&self, _token_hash: &[u8]) -> StoreResult<()> {
        down()
    }
    async fn delete_user_sessions(&self, _user_id: Uuid, _keep: &[Vec<u8>]) -> StoreResult<u64> {
        down()
    }
    async fn delete_expired_sessions(&self, _now: DateTime<Utc>) -> StoreResult<u64> {
        down()
    }
    async fn insert_promotion_request(&self, _user_id: Uuid) -> StoreResult<i64> {
        down()
    }
    async fn list_pending_promotions(&self) -> StoreResult<Vec<PendingPromotion>> {
        down()
    }
    async fn approve_promotion(&self, _request_id: i64, _approver: Uuid) -> StoreResult<Uuid> {
        down()
    }
    async fn reject_promotion(&self, _request_id: i64, _approver: Uuid) -> StoreResult<()> {
        down()
    }
}

fn failing_state(config: AuthConfig) -> Result<Arc<AuthState>> {
    let oauth = oauth_client(&config)?;
    Ok(Arc::new(AuthState::new(
        config,
        Arc::new(FailingStore),
        Arc::new(NoopRateLimiter),
        oauth,
    )))
}

fn failing_app() -> Result<(Arc<AuthState>, Router)> {
    let state = failing_state(test_config())?;
    Ok((state.clone(), crate::api::router(state)))
}

#[tokio::test]
async fn store_failure_is_internal_error_not_a_failed_attempt() -> Result<()> {
    let (state, app) = failing_app()?;

    let response = app
        .clone()
        .oneshot(login_request("alice@example.com", PASSWORD)?)
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await?, "Internal server error");
    assert_eq!(state.throttle().failures(CLIENT_IP), 0);

    let response = app
        .clone()
        .oneshot(get_with_cookie(
            "/v1/moderation/moderators",
            Some(&format!("{SESSION_COOKIE}=anything")),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    Ok(())
}

#[tokio::test]
async fn health_reflects_store_reachability() -> Result<()> {
    let harness = harness()?;
    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/health", None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("X-App"));
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await?)?;
    assert_eq!(body["database"], "ok");
    assert_eq!(body["name"], env!("CARGO_PKG_NAME"));

    let (_, app) = failing_app()?;
    let response = app.oneshot(get_with_cookie("/health", None)?).await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await?)?;
    assert_eq!(body["database"], "error");
    Ok(())
}

#[tokio::test]
async fn responses_carry_request_id() -> Result<()> {
    let harness = harness()?;
    let response = harness
        .app
        .clone()
        .oneshot(get_with_cookie("/health", None)?)
        .await?;
    assert!(response.headers().contains_key("x-request-id"));

    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "fixed-id")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("fixed-id")
    );
    Ok(())
}

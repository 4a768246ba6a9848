use crate::{
    api::handlers::{
        auth::{
            self, account, login, moderation, oauth,
            rate_limit::{limit_requests, RateLimitAction},
            AuthConfig, AuthState, OAuthClient, OAuthConfig, Role, SlidingWindowRateLimiter,
        },
        health,
    },
    store::{CredentialStore, PgStore},
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware,
    routing::{get, post},
    Extension, Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;
use utoipa_swagger_ui::SwaggerUi;

pub mod handlers;
mod openapi;

pub use openapi::openapi;

fn rate_limited(
    auth_state: &Arc<AuthState>,
    action: RateLimitAction,
    routes: Router,
) -> Router {
    routes.route_layer(middleware::from_fn_with_state(
        (auth_state.clone(), action),
        limit_requests,
    ))
}

/// Build the application router around an already constructed [`AuthState`].
///
/// Credential endpoints sit behind the request rate limiter, moderation
/// endpoints behind role checks.
#[must_use]
pub fn router(auth_state: Arc<AuthState>) -> Router {
    let register = rate_limited(
        &auth_state,
        RateLimitAction::Register,
        Router::new().route("/register", post(login::register)),
    );
    let password_login = rate_limited(
        &auth_state,
        RateLimitAction::Login,
        Router::new().route("/login", post(login::login)),
    );
    let federated = rate_limited(
        &auth_state,
        RateLimitAction::Federated,
        Router::new()
            .route("/auth/:provider", get(oauth::oauth_start))
            .route("/auth/callback/:provider", get(oauth::oauth_callback)),
    );

    let members = auth::require_role(
        auth_state.clone(),
        Role::User,
        Router::new()
            .route("/v1/account", post(account::update_account))
            .route("/v1/moderation/requests", post(moderation::request_promotion)),
    );
    let admins = auth::require_role(
        auth_state.clone(),
        Role::Admin,
        Router::new()
            .route("/v1/moderation/requests", get(moderation::list_requests))
            .route(
                "/v1/moderation/requests/approve",
                post(moderation::approve_request),
            )
            .route(
                "/v1/moderation/requests/reject",
                post(moderation::reject_request),
            )
            .route(
                "/v1/moderation/moderators",
                get(moderation::list_moderators),
            )
            .route(
                "/v1/moderation/moderators/remove",
                post(moderation::remove_moderator),
            )
            .route("/v1/users/role", post(moderation::set_role)),
    );

    Router::new()
        .route("/health", get(health::health))
        .route("/logout", post(login::logout))
        .route("/v1/auth/session", get(login::session))
        .merge(register)
        .merge(password_login)
        .merge(federated)
        .merge(members)
        .merge(admins)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(auth_state)),
        )
}

/// Start the server
/// # Errors
/// Return error if the database is unreachable, the schema cannot be applied
/// or the listener fails
pub async fn new(
    port: u16,
    dsn: String,
    auth_config: AuthConfig,
    oauth_config: OAuthConfig,
) -> Result<()> {
    let store: Arc<dyn CredentialStore> = Arc::new(
        PgStore::connect(&dsn)
            .await
            .context("Failed to connect to database")?,
    );

    let limiter = Arc::new(SlidingWindowRateLimiter::new(
        auth_config.request_limit(),
        auth_config.request_window(),
    ));
    let oauth_client = OAuthClient::new(oauth_config, auth_config.public_base_url())
        .context("Failed to build OAuth client")?;

    let session_sweep = auth_config.session_sweep();
    let throttle_idle = auth_config.throttle_idle();
    let auth_state = Arc::new(AuthState::new(
        auth_config,
        store,
        limiter.clone(),
        oauth_client,
    ));

    let sweepers = [
        auth_state.sessions().clone().spawn_sweeper(session_sweep),
        limiter.spawn_sweeper(),
        auth_state
            .throttle()
            .clone()
            .spawn_sweeper(session_sweep, throttle_idle),
    ];

    let app = router(auth_state);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {err}");
        }
        info!("Gracefully shutdown");
    })
    .await?;

    for sweeper in sweepers {
        sweeper.abort();
    }

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

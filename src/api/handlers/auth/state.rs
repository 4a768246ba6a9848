//! Auth state and configuration shared by every handler.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{
    error::AuthError,
    federation::IdentityFederator,
    oauth::OAuthClient,
    password::verify_password,
    rate_limit::{RateLimiter, DEFAULT_REQUEST_LIMIT, DEFAULT_REQUEST_WINDOW},
    session::{IssuedSession, SessionManager, DEFAULT_SESSION_TTL},
    throttle::{Attempt, LoginThrottle, DEFAULT_IDLE},
};
use crate::store::{CredentialStore, SessionSource};

const DEFAULT_SESSION_SWEEP: Duration = Duration::from_secs(60 * 60);
const DEFAULT_LOGIN_FAILURE_DELAY: Duration = Duration::from_secs(4);

#[derive(Clone, Debug)]
pub struct AuthConfig {
    public_base_url: String,
    session_ttl: Duration,
    session_sweep: Duration,
    login_failure_delay: Duration,
    request_limit: usize,
    request_window: Duration,
    throttle_idle: Duration,
    trusted_proxies: Vec<IpAddr>,
}

impl AuthConfig {
    #[must_use]
    pub fn new(public_base_url: String) -> Self {
        Self {
            public_base_url,
            session_ttl: DEFAULT_SESSION_TTL,
            session_sweep: DEFAULT_SESSION_SWEEP,
            login_failure_delay: DEFAULT_LOGIN_FAILURE_DELAY,
            request_limit: DEFAULT_REQUEST_LIMIT,
            request_window: DEFAULT_REQUEST_WINDOW,
            throttle_idle: DEFAULT_IDLE,
            trusted_proxies: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: u64) -> Self {
        self.session_ttl = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_session_sweep_seconds(mut self, seconds: u64) -> Self {
        self.session_sweep = Duration::from_secs(seconds);
        self
    }

    /// Pause applied after every failed credential check. Zero disables it.
    #[must_use]
    pub fn with_login_failure_delay(mut self, delay: Duration) -> Self {
        self.login_failure_delay = delay;
        self
    }

    #[must_use]
    pub fn with_request_limit(mut self, limit: usize, window_seconds: u64) -> Self {
        self.request_limit = limit;
        self.request_window = Duration::from_secs(window_seconds);
        self
    }

    #[must_use]
    pub fn with_throttle_idle_seconds(mut self, seconds: u64) -> Self {
        self.throttle_idle = Duration::from_secs(seconds);
        self
    }

    /// Peers allowed to report the client address in forwarding headers.
    #[must_use]
    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = proxies;
        self
    }

    #[must_use]
    pub fn public_base_url(&self) -> &str {
        &self.public_base_url
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    #[must_use]
    pub fn session_sweep(&self) -> Duration {
        self.session_sweep
    }

    #[must_use]
    pub fn login_failure_delay(&self) -> Duration {
        self.login_failure_delay
    }

    #[must_use]
    pub fn request_limit(&self) -> usize {
        self.request_limit
    }

    #[must_use]
    pub fn request_window(&self) -> Duration {
        self.request_window
    }

    #[must_use]
    pub fn throttle_idle(&self) -> Duration {
        self.throttle_idle
    }

    #[must_use]
    pub fn trusted_proxies(&self) -> &[IpAddr] {
        &self.trusted_proxies
    }
}

pub struct AuthState {
    config: AuthConfig,
    store: Arc<dyn CredentialStore>,
    sessions: Arc<SessionManager>,
    throttle: Arc<LoginThrottle>,
    rate_limiter: Arc<dyn RateLimiter>,
    federator: IdentityFederator,
    oauth: OAuthClient,
}

impl AuthState {
    #[must_use]
    pub fn new(
        config: AuthConfig,
        store: Arc<dyn CredentialStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        oauth: OAuthClient,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(store.clone(), config.session_ttl()));
        Self {
            federator: IdentityFederator::new(store.clone()),
            throttle: Arc::new(LoginThrottle::new()),
            config,
            store,
            sessions,
            rate_limiter,
            oauth,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &dyn CredentialStore {
        self.store.as_ref()
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    #[must_use]
    pub fn throttle(&self) -> &Arc<LoginThrottle> {
        &self.throttle
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &dyn RateLimiter {
        self.rate_limiter.as_ref()
    }

    #[must_use]
    pub fn federator(&self) -> &IdentityFederator {
        &self.federator
    }

    #[must_use]
    pub fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }

    async fn failure_delay(&self) {
        let delay = self.config.login_failure_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Throttled password login for `client`.
    ///
    /// A locked client is refused before the store is consulted. Every other
    /// attempt is counted before the password is checked, so concurrent
    /// guesses share one budget. Failed checks are delayed; store faults are
    /// delayed and their reservation is returned. Success issues a password
    /// session and clears the client's throttle state.
    ///
    /// # Errors
    /// `RateLimited`, `InvalidCredentials`, `StoreFailure` or `Internal`.
    pub async fn password_login(
        &self,
        client: &str,
        email: &str,
        password: &str,
    ) -> Result<IssuedSession, AuthError> {
        let lockout = match self.throttle.begin_attempt(client) {
            Attempt::Locked { remaining } => {
                warn!("Login attempt from locked client {client}");
                return Err(AuthError::RateLimited { remaining });
            }
            Attempt::Reserved { lockout } => lockout,
        };

        match verify_password(self.store.as_ref(), email, password).await {
            Ok(user_id) => {
                self.throttle.reset(client);
                let issued = self
                    .sessions
                    .create_session(user_id, SessionSource::Password)
                    .await?;
                info!("Password login for {user_id}");
                Ok(issued)
            }
            Err(AuthError::InvalidCredentials) => {
                self.failure_delay().await;
                if lockout.is_zero() {
                    Err(AuthError::InvalidCredentials)
                } else {
                    warn!(
                        "Client {client} locked out for {}s after repeated failures",
                        lockout.as_secs()
                    );
                    Err(AuthError::RateLimited { remaining: lockout })
                }
            }
            Err(err) => {
                self.throttle.release(client, lockout);
                self.failure_delay().await;
                Err(err)
            }
        }
    }
}

//! Request rate limiting for auth endpoints.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

use super::{state::AuthState, utils::client_identifier};

pub const DEFAULT_REQUEST_LIMIT: usize = 30;
pub const DEFAULT_REQUEST_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Register,
    Login,
    Federated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    fn check_ip(&self, ip: Option<&str>, action: RateLimitAction) -> RateLimitDecision;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check_ip(&self, _ip: Option<&str>, _action: RateLimitAction) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

type WindowKey = (RateLimitAction, String);

/// Sliding window: at most `limit` requests per `window` for each
/// `(action, client)` key.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    limit: usize,
    window: Duration,
    hits: Mutex<HashMap<WindowKey, VecDeque<Instant>>>,
}

impl Default for SlidingWindowRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_LIMIT, DEFAULT_REQUEST_WINDOW)
    }
}

impl SlidingWindowRateLimiter {
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    fn hits(&self) -> MutexGuard<'_, HashMap<WindowKey, VecDeque<Instant>>> {
        self.hits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn check_at(
        &self,
        client: &str,
        action: RateLimitAction,
        now: Instant,
    ) -> RateLimitDecision {
        let mut hits = self.hits();
        let entry = hits.entry((action, client.to_string())).or_default();
        while entry
            .front()
            .is_some_and(|hit| now.saturating_duration_since(*hit) >= self.window)
        {
            entry.pop_front();
        }
        if entry.len() >= self.limit {
            return RateLimitDecision::Limited;
        }
        entry.push_back(now);
        RateLimitDecision::Allowed
    }

    /// Remove keys with no request inside the window.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let window = self.window;
        let mut hits = self.hits();
        let before = hits.len();
        hits.retain(|_, entry| {
            entry.retain(|hit| now.saturating_duration_since(*hit) < window);
            !entry.is_empty()
        });
        before - hits.len()
    }

    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.hits().len()
    }

    /// Sweep every `window` on the runtime until the process exits.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.window);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    debug!("Request limiter swept {removed} idle keys");
                }
            }
        })
    }
}

impl RateLimiter for SlidingWindowRateLimiter {
    fn check_ip(&self, ip: Option<&str>, action: RateLimitAction) -> RateLimitDecision {
        self.check_at(ip.unwrap_or("unknown"), action, Instant::now())
    }
}

/// Route middleware: rejects with 429 when the caller's key is over the limit.
pub async fn limit_requests(
    State((auth_state, action)): State<(Arc<AuthState>, RateLimitAction)>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identifier(
        request.headers(),
        peer,
        auth_state.config().trusted_proxies(),
    );
    match auth_state.rate_limiter().check_ip(Some(&client), action) {
        RateLimitDecision::Allowed => next.run(request).await,
        RateLimitDecision::Limited => {
            warn!("Request rate limit hit for {client} on {action:?}");
            (StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response()
        }
    }
}

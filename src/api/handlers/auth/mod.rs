//! Authentication, sessions and role-based access control.
//!
//! Flow overview:
//! - Password login: form → `LoginThrottle` gate → Argon2 check against the
//!   credential store → session row + `pordisto_session` cookie.
//! - Federated login: provider redirect → callback exchanges the code for a
//!   verified email → `IdentityFederator` finds or creates the user →
//!   session row + `pordisto_federated` cookie.
//! - Every protected route resolves the caller from either cookie (or a
//!   bearer header) and compares its role against the route's minimum.
//!
//! Failed password checks are delayed and counted per client. After five
//! failures each further one locks the client out for an exponentially
//! growing window; a success clears the count.

pub mod account;
pub mod authorize;
pub mod error;
pub mod federation;
pub mod login;
pub mod moderation;
pub mod oauth;
pub mod password;
pub mod rate_limit;
pub mod role;
pub mod session;
pub mod state;
pub mod throttle;
pub mod types;
pub(crate) mod utils;

#[cfg(test)]
mod tests;

pub use authorize::{check_role, require_role};
pub use error::AuthError;
pub use federation::IdentityFederator;
pub use oauth::{OAuthClient, OAuthConfig, OAuthProvider, ProviderCredentials};
pub use rate_limit::{
    NoopRateLimiter, RateLimitAction, RateLimitDecision, RateLimiter, SlidingWindowRateLimiter,
};
pub use role::Role;
pub use session::{Caller, IssuedSession, SessionManager};
pub use state::{AuthConfig, AuthState};
pub use throttle::{Attempt, LockStatus, LoginThrottle};

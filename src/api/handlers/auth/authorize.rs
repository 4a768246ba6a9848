//! Role-based gate for routes.

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use std::sync::Arc;
use tracing::debug;

use super::{error::AuthError, role::Role, state::AuthState};

/// Gate every route in `router` behind `minimum`.
///
/// Unauthenticated callers get 401, callers below `minimum` get 403. On
/// success the resolved [`Caller`](super::session::Caller) is inserted into
/// the request extensions for the handler.
pub fn require_role<S>(auth_state: Arc<AuthState>, minimum: Role, router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(middleware::from_fn_with_state(
        (auth_state, minimum),
        enforce_role,
    ))
}

async fn enforce_role(
    State((auth_state, minimum)): State<(Arc<AuthState>, Role)>,
    mut request: Request,
    next: Next,
) -> Response {
    let caller = match auth_state.sessions().resolve_caller(request.headers()).await {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };
    if !caller.role.satisfies(minimum) {
        debug!(
            "Caller {} with role {} denied, {} required",
            caller.user_id, caller.role, minimum
        );
        return AuthError::Forbidden.into_response();
    }
    request.extensions_mut().insert(caller);
    next.run(request).await
}

/// Compare role names; an unrecognized name on either side is a fault.
///
/// # Errors
/// `UnknownRole` or `Forbidden`.
pub fn check_role(caller_role: &str, required: &str) -> Result<(), AuthError> {
    let caller: Role = caller_role.parse()?;
    let required: Role = required.parse()?;
    if caller.satisfies(required) {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

//! Moderator promotion workflow and manual role management.
//!
//! Users ask to become moderators; admins approve or reject the pending
//! requests. Approval changes the user's role and closes the request in one
//! store transaction.

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{
    error::AuthError,
    role::Role,
    session::Caller,
    state::AuthState,
    types::{
        ModeratorResponse, PendingPromotionResponse, PromotionCreated, PromotionDecision,
        RemoveModeratorRequest, SetRoleRequest,
    },
};
use crate::store::StoreError;

fn parse_user_id(value: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(value.trim())
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid user id").into_response())
}

#[utoipa::path(
    post,
    path = "/v1/moderation/requests",
    responses(
        (status = 201, description = "Promotion request created", body = PromotionCreated),
        (status = 401, description = "No active session"),
        (status = 409, description = "A request is already pending, or the caller is already a moderator")
    ),
    tag = "moderation"
)]
pub async fn request_promotion(
    Extension(auth_state): Extension<Arc<AuthState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Response, AuthError> {
    if caller.role.satisfies(Role::Moderator) {
        return Ok((StatusCode::CONFLICT, "Already a moderator").into_response());
    }
    match auth_state
        .store()
        .insert_promotion_request(caller.user_id)
        .await
    {
        Ok(id) => {
            info!("User {} requested promotion ({id})", caller.user_id);
            Ok((StatusCode::CREATED, Json(PromotionCreated { id })).into_response())
        }
        Err(StoreError::UniqueViolation) => {
            Ok((StatusCode::CONFLICT, "Request already pending").into_response())
        }
        Err(StoreError::NotFound) => Err(AuthError::Unauthenticated),
        Err(err) => Err(err.into()),
    }
}

#[utoipa::path(
    get,
    path = "/v1/moderation/requests",
    responses(
        (status = 200, description = "Pending promotion requests", body = [PendingPromotionResponse]),
        (status = 403, description = "Admin role required")
    ),
    tag = "moderation"
)]
pub async fn list_requests(
    Extension(auth_state): Extension<Arc<AuthState>>,
) -> Result<Json<Vec<PendingPromotionResponse>>, AuthError> {
    let pending = auth_state.store().list_pending_promotions().await?;
    Ok(Json(
        pending
            .into_iter()
            .map(|request| PendingPromotionResponse {
                id: request.id,
                user_id: request.user_id.to_string(),
                username: request.username,
                requested_at: request.requested_at.to_rfc3339(),
            })
            .collect(),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/moderation/requests/approve",
    request_body = PromotionDecision,
    responses(
        (status = 204, description = "User promoted to moderator"),
        (status = 404, description = "No such pending request")
    ),
    tag = "moderation"
)]
pub async fn approve_request(
    Extension(auth_state): Extension<Arc<AuthState>>,
    Extension(caller): Extension<Caller>,
    Json(decision): Json<PromotionDecision>,
) -> Result<Response, AuthError> {
    match auth_state
        .store()
        .approve_promotion(decision.request_id, caller.user_id)
        .await
    {
        Ok(user_id) => {
            info!(
                "Admin {} promoted {user_id} to moderator (request {})",
                caller.user_id, decision.request_id
            );
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Err(StoreError::NotFound) => {
            Ok((StatusCode::NOT_FOUND, "Request not found").into_response())
        }
        Err(err) => Err(err.into()),
    }
}

#[utoipa::path(
    post,
    path = "/v1/moderation/requests/reject",
    request_body = PromotionDecision,
    responses(
        (status = 204, description = "Request rejected"),
        (status = 404, description = "No such pending request")
    ),
    tag = "moderation"
)]
pub async fn reject_request(
    Extension(auth_state): Extension<Arc<AuthState>>,
    Extension(caller): Extension<Caller>,
    Json(decision): Json<PromotionDecision>,
) -> Result<Response, AuthError> {
    match auth_state
        .store()
        .reject_promotion(decision.request_id, caller.user_id)
        .await
    {
        Ok(()) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(StoreError::NotFound) => {
            Ok((StatusCode::NOT_FOUND, "Request not found").into_response())
        }
        Err(err) => Err(err.into()),
    }
}

#[utoipa::path(
    get,
    path = "/v1/moderation/moderators",
    responses(
        (status = 200, description = "Current moderators", body = [ModeratorResponse])
    ),
    tag = "moderation"
)]
pub async fn list_moderators(
    Extension(auth_state): Extension<Arc<AuthState>>,
) -> Result<Json<Vec<ModeratorResponse>>, AuthError> {
    let moderators = auth_state
        .store()
        .list_users_with_role(Role::Moderator.as_str())
        .await?;
    Ok(Json(
        moderators
            .into_iter()
            .map(|user| ModeratorResponse {
                user_id: user.id.to_string(),
                username: user.username,
            })
            .collect(),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/moderation/moderators/remove",
    request_body = RemoveModeratorRequest,
    responses(
        (status = 204, description = "Moderator demoted to user"),
        (status = 400, description = "Invalid user id"),
        (status = 404, description = "User is not a moderator")
    ),
    tag = "moderation"
)]
pub async fn remove_moderator(
    Extension(auth_state): Extension<Arc<AuthState>>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<RemoveModeratorRequest>,
) -> Result<Response, AuthError> {
    let user_id = match parse_user_id(&request.user_id) {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    let is_moderator = auth_state
        .store()
        .find_user_by_id(user_id)
        .await?
        .is_some_and(|user| user.role == Role::Moderator.as_str());
    if !is_moderator {
        return Ok((StatusCode::NOT_FOUND, "Moderator not found").into_response());
    }

    auth_state
        .store()
        .set_user_role(user_id, Role::User.as_str())
        .await?;
    info!("Admin {} demoted moderator {user_id}", caller.user_id);
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[utoipa::path(
    post,
    path = "/v1/users/role",
    request_body = SetRoleRequest,
    responses(
        (status = 204, description = "Role updated"),
        (status = 400, description = "Invalid user id or unknown role"),
        (status = 404, description = "User not found")
    ),
    tag = "moderation"
)]
pub async fn set_role(
    Extension(auth_state): Extension<Arc<AuthState>>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<SetRoleRequest>,
) -> Result<Response, AuthError> {
    let user_id = match parse_user_id(&request.user_id) {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    // Client input: an unknown name is a bad request, not a server fault.
    let Ok(role) = request.role.trim().parse::<Role>() else {
        return Ok((StatusCode::BAD_REQUEST, "Unknown role").into_response());
    };

    match auth_state.store().set_user_role(user_id, role.as_str()).await {
        Ok(()) => {
            info!("Admin {} set role of {user_id} to {role}", caller.user_id);
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Err(StoreError::NotFound) => Ok((StatusCode::NOT_FOUND, "User not found").into_response()),
        Err(err) => Err(err.into()),
    }
}

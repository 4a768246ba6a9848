//! Request/response types for auth and moderation endpoints.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::role::Role;

#[derive(ToSchema, Deserialize)]
pub struct RegisterForm {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(ToSchema, Deserialize)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

/// Blank or missing fields are left unchanged.
#[derive(ToSchema, Deserialize, Default)]
pub struct AccountUpdateForm {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionResponse {
    pub user_id: String,
    pub role: Role,
    /// `password` or `federated`.
    pub source: String,
}

#[derive(IntoParams, Deserialize, Debug)]
#[into_params(parameter_in = Query)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PromotionCreated {
    pub id: i64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PendingPromotionResponse {
    pub id: i64,
    pub user_id: String,
    pub username: String,
    pub requested_at: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PromotionDecision {
    pub request_id: i64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ModeratorResponse {
    pub user_id: String,
    pub username: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RemoveModeratorRequest {
    pub user_id: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SetRoleRequest {
    pub user_id: String,
    /// Role name; must be one of guest, user, moderator, admin.
    pub role: String,
}

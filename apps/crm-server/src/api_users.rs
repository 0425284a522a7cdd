use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crm_core::notify::AdminNotifier;
use crm_kernel::NewUser;
use crm_protocol::{Principal, RealtimeEventType, Role, User};

use crate::identity::{fingerprint, require_admin, require_principal};
use crate::problem::ApiError;
use crate::AppState;

#[derive(Deserialize, ToSchema)]
pub(crate) struct CreateUserReq {
    pub email: String,
    #[serde(default)]
    pub role: Option<Role>,
    /// Plaintext access token; only its sha256 fingerprint is stored.
    pub token: String,
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct SetRoleReq {
    pub role: Role,
}

/// The caller's own identity.
#[utoipa::path(get, path = "/whoami", tag = "Users", responses((status = 200, body = Principal)))]
pub async fn whoami(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(require_principal(&state.kernel, &headers)?))
}

#[utoipa::path(get, path = "/admin/users", tag = "Users", responses((status = 200, body = serde_json::Value)))]
pub async fn users_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state.kernel, &headers)?;
    let items = state.kernel.list_users(200).map_err(ApiError::internal)?;
    Ok(Json(json!({"items": items})))
}

#[utoipa::path(post, path = "/admin/users", tag = "Users", request_body = CreateUserReq, responses((status = 201, body = User)))]
pub async fn users_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateUserReq>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state.kernel, &headers)?;
    let email = req.email.trim().to_string();
    if email.is_empty() || !email.contains('@') {
        return Err(crm_core::CoreError::Validation("invalid email".into()).into());
    }
    if req.token.trim().is_empty() {
        return Err(crm_core::CoreError::Validation("token must not be empty".into()).into());
    }
    let user = state
        .kernel
        .insert_user(&NewUser {
            email,
            role: req.role.unwrap_or(Role::User),
            token_sha256: Some(fingerprint(&req.token)),
        })
        .map_err(ApiError::internal)?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// Change a user's role and broadcast the change to admins.
#[utoipa::path(
    patch,
    path = "/admin/users/{id}/role",
    tag = "Users",
    request_body = SetRoleReq,
    responses((status = 200, body = User), (status = 404, description = "Unknown user"))
)]
pub async fn users_set_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<SetRoleReq>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_admin(&state.kernel, &headers)?;
    let user = state
        .kernel
        .set_user_role(id, req.role)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::from(crm_core::CoreError::NotFound("user not found".into())))?;
    let notification = AdminNotifier::notification(
        &principal,
        RealtimeEventType::UserRoleChanged,
        "user",
        Some(user.id),
        format!("User role changed: {} → {}", user.email, user.role),
        Some(json!({"userId": user.id, "email": user.email, "role": user.role})),
    );
    state.notifier.notify(&notification);
    Ok(Json(user))
}

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;

use crm_core::activity::{ActivityChange, ActivityDraft};
use crm_protocol::{Activity, ActivityListQuery, ActivityType};

use crate::identity::require_principal;
use crate::problem::ApiError;
use crate::AppState;

#[derive(Deserialize, ToSchema)]
pub(crate) struct CreateActivityReq {
    #[serde(rename = "type")]
    pub kind: ActivityType,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub lead_id: Option<i64>,
    #[serde(default)]
    pub customer_id: Option<i64>,
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct UpdateActivityReq {
    #[serde(rename = "type", default)]
    pub kind: Option<ActivityType>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub lead_id: Option<i64>,
    #[serde(default)]
    pub customer_id: Option<i64>,
}

/// Log an activity against exactly one lead or customer.
#[utoipa::path(
    post,
    path = "/activities",
    tag = "Activities",
    request_body = CreateActivityReq,
    responses(
        (status = 201, body = Activity),
        (status = 400, description = "Both or neither target provided")
    )
)]
pub async fn activities_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateActivityReq>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    let activity = state.activities.append(
        &principal,
        &ActivityDraft {
            kind: req.kind,
            note: req.note,
            when: req.when,
            lead_id: req.lead_id,
            customer_id: req.customer_id,
        },
    )?;
    Ok((StatusCode::CREATED, Json(activity)))
}

/// Filtered, paginated activity listing.
#[utoipa::path(get, path = "/activities", tag = "Activities", responses((status = 200, body = serde_json::Value)))]
pub async fn activities_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ActivityListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_principal(&state.kernel, &headers)?;
    Ok(Json(state.activities.list(&query)?))
}

#[utoipa::path(get, path = "/activities/{id}", tag = "Activities", responses((status = 200, body = Activity)))]
pub async fn activities_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    require_principal(&state.kernel, &headers)?;
    Ok(Json(state.activities.get(id)?))
}

#[utoipa::path(patch, path = "/activities/{id}", tag = "Activities", request_body = UpdateActivityReq, responses((status = 200, body = Activity)))]
pub async fn activities_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<UpdateActivityReq>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    let activity = state.activities.update(
        &principal,
        id,
        &ActivityChange {
            kind: req.kind,
            note: req.note,
            when: req.when,
            lead_id: req.lead_id,
            customer_id: req.customer_id,
        },
    )?;
    Ok(Json(activity))
}

#[utoipa::path(delete, path = "/activities/{id}", tag = "Activities", responses((status = 200, body = serde_json::Value)))]
pub async fn activities_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    state.activities.soft_delete(&principal, id)?;
    Ok(Json(serde_json::json!({"success": true})))
}

#[utoipa::path(post, path = "/activities/{id}/restore", tag = "Activities", responses((status = 200, body = Activity)))]
pub async fn activities_restore(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    Ok(Json(state.activities.restore(&principal, id)?))
}

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crm_core::lifecycle::LeadDraft;
use crm_kernel::LeadPatch;
use crm_protocol::{Customer, Lead, LeadStatus, ListQuery};

use crate::identity::require_principal;
use crate::problem::ApiError;
use crate::AppState;

#[derive(Deserialize, ToSchema)]
pub(crate) struct CreateLeadReq {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct UpdateLeadReq {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct ChangeStatusReq {
    pub status: LeadStatus,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct MarkLostReq {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub(crate) struct ConvertResp {
    pub customer: Customer,
    pub lead_id: i64,
    pub status: LeadStatus,
}

/// Create a lead owned by the caller.
#[utoipa::path(
    post,
    path = "/leads",
    tag = "Leads",
    request_body = CreateLeadReq,
    responses((status = 201, description = "Created", body = Lead))
)]
pub async fn leads_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateLeadReq>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    let lead = state.leads.create(
        &principal,
        &LeadDraft {
            name: req.name,
            email: req.email,
            phone: req.phone,
            notes: req.notes,
        },
    )?;
    Ok((StatusCode::CREATED, Json(lead)))
}

/// Paginated lead listing with free-text search.
#[utoipa::path(get, path = "/leads", tag = "Leads", responses((status = 200, body = serde_json::Value)))]
pub async fn leads_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_principal(&state.kernel, &headers)?;
    Ok(Json(state.leads.list(&query)?))
}

#[utoipa::path(get, path = "/leads/{id}", tag = "Leads", responses((status = 200, body = Lead)))]
pub async fn leads_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    require_principal(&state.kernel, &headers)?;
    Ok(Json(state.leads.get(id)?))
}

#[utoipa::path(patch, path = "/leads/{id}", tag = "Leads", request_body = UpdateLeadReq, responses((status = 200, body = Lead)))]
pub async fn leads_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<UpdateLeadReq>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    let lead = state.leads.update(
        &principal,
        id,
        &LeadPatch {
            name: req.name,
            email: req.email,
            phone: req.phone,
            notes: req.notes,
        },
    )?;
    Ok(Json(lead))
}

#[utoipa::path(delete, path = "/leads/{id}", tag = "Leads", responses((status = 200, body = serde_json::Value)))]
pub async fn leads_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    state.leads.soft_delete(&principal, id)?;
    Ok(Json(serde_json::json!({"success": true})))
}

#[utoipa::path(post, path = "/leads/{id}/restore", tag = "Leads", responses((status = 200, body = Lead)))]
pub async fn leads_restore(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    Ok(Json(state.leads.restore(&principal, id)?))
}

/// Transition a lead's status; a no-op when the status already matches.
#[utoipa::path(
    post,
    path = "/leads/{id}/status",
    tag = "Leads",
    request_body = ChangeStatusReq,
    responses(
        (status = 200, body = Lead),
        (status = 409, description = "Converted lead or concurrent transition")
    )
)]
pub async fn leads_change_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<ChangeStatusReq>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    let lead = state
        .leads
        .change_status(&principal, id, req.status, req.note.as_deref())?;
    Ok(Json(lead))
}

/// Convert a lead into a customer (idempotent).
#[utoipa::path(
    post,
    path = "/leads/{id}/convert",
    tag = "Leads",
    responses(
        (status = 200, body = ConvertResp),
        (status = 409, description = "Lost lead cannot be converted")
    )
)]
pub async fn leads_convert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    let outcome = state.leads.convert_to_customer(&principal, id)?;
    Ok(Json(ConvertResp {
        lead_id: outcome.lead.id,
        status: outcome.lead.status,
        customer: outcome.customer,
    }))
}

/// Mark a lead as lost (idempotent).
#[utoipa::path(
    post,
    path = "/leads/{id}/lost",
    tag = "Leads",
    request_body = MarkLostReq,
    responses(
        (status = 200, body = Lead),
        (status = 409, description = "Converted lead cannot be lost")
    )
)]
pub async fn leads_mark_lost(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<MarkLostReq>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    let lead = state
        .leads
        .mark_lost(&principal, id, req.reason.as_deref())?;
    Ok(Json(lead))
}

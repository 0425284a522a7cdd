use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;

use crm_core::customer::CustomerDraft;
use crm_kernel::CustomerPatch;
use crm_protocol::{Customer, ListQuery};

use crate::identity::require_principal;
use crate::problem::ApiError;
use crate::AppState;

#[derive(Deserialize, ToSchema)]
pub(crate) struct CreateCustomerReq {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct UpdateCustomerReq {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
}

#[utoipa::path(post, path = "/customers", tag = "Customers", request_body = CreateCustomerReq, responses((status = 201, body = Customer)))]
pub async fn customers_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateCustomerReq>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    let customer = state.customers.create(
        &principal,
        &CustomerDraft {
            name: req.name,
            email: req.email,
            phone: req.phone,
            company: req.company,
        },
    )?;
    Ok((StatusCode::CREATED, Json(customer)))
}

#[utoipa::path(get, path = "/customers", tag = "Customers", responses((status = 200, body = serde_json::Value)))]
pub async fn customers_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_principal(&state.kernel, &headers)?;
    Ok(Json(state.customers.list(&query)?))
}

#[utoipa::path(get, path = "/customers/{id}", tag = "Customers", responses((status = 200, body = Customer)))]
pub async fn customers_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    require_principal(&state.kernel, &headers)?;
    Ok(Json(state.customers.get(id)?))
}

#[utoipa::path(patch, path = "/customers/{id}", tag = "Customers", request_body = UpdateCustomerReq, responses((status = 200, body = Customer)))]
pub async fn customers_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<UpdateCustomerReq>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    let customer = state.customers.update(
        &principal,
        id,
        &CustomerPatch {
            name: req.name,
            email: req.email,
            phone: req.phone,
            company: req.company,
        },
    )?;
    Ok(Json(customer))
}

#[utoipa::path(delete, path = "/customers/{id}", tag = "Customers", responses((status = 200, body = serde_json::Value)))]
pub async fn customers_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    state.customers.soft_delete(&principal, id)?;
    Ok(Json(serde_json::json!({"success": true})))
}

#[utoipa::path(post, path = "/customers/{id}/restore", tag = "Customers", responses((status = 200, body = Customer)))]
pub async fn customers_restore(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    Ok(Json(state.customers.restore(&principal, id)?))
}

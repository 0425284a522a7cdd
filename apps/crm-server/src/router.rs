use axum::routing::{get, patch, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{
    api_activities, api_customers, api_events, api_leads, api_users, openapi, AppState,
};

pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/spec/openapi.json", get(openapi::openapi_json))
        .route("/whoami", get(api_users::whoami))
        .route("/leads", post(api_leads::leads_create).get(api_leads::leads_list))
        .route(
            "/leads/{id}",
            get(api_leads::leads_get)
                .patch(api_leads::leads_update)
                .delete(api_leads::leads_delete),
        )
        .route("/leads/{id}/restore", post(api_leads::leads_restore))
        .route("/leads/{id}/status", post(api_leads::leads_change_status))
        .route("/leads/{id}/convert", post(api_leads::leads_convert))
        .route("/leads/{id}/lost", post(api_leads::leads_mark_lost))
        .route(
            "/customers",
            post(api_customers::customers_create).get(api_customers::customers_list),
        )
        .route(
            "/customers/{id}",
            get(api_customers::customers_get)
                .patch(api_customers::customers_update)
                .delete(api_customers::customers_delete),
        )
        .route("/customers/{id}/restore", post(api_customers::customers_restore))
        .route(
            "/activities",
            post(api_activities::activities_create).get(api_activities::activities_list),
        )
        .route(
            "/activities/{id}",
            get(api_activities::activities_get)
                .patch(api_activities::activities_update)
                .delete(api_activities::activities_delete),
        )
        .route("/activities/{id}/restore", post(api_activities::activities_restore))
        .route("/admin/events", get(api_events::events_sse))
        .route("/admin/users", get(api_users::users_list).post(api_users::users_create))
        .route("/admin/users/{id}/role", patch(api_users::users_set_role))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

use axum::Json;
use utoipa::OpenApi;

use crate::{api_activities, api_customers, api_events, api_leads, api_users};

#[derive(OpenApi)]
#[openapi(
    info(title = "crm-server", description = "Lead lifecycle CRM service"),
    paths(
        api_leads::leads_create,
        api_leads::leads_list,
        api_leads::leads_get,
        api_leads::leads_update,
        api_leads::leads_delete,
        api_leads::leads_restore,
        api_leads::leads_change_status,
        api_leads::leads_convert,
        api_leads::leads_mark_lost,
        api_customers::customers_create,
        api_customers::customers_list,
        api_customers::customers_get,
        api_customers::customers_update,
        api_customers::customers_delete,
        api_customers::customers_restore,
        api_activities::activities_create,
        api_activities::activities_list,
        api_activities::activities_get,
        api_activities::activities_update,
        api_activities::activities_delete,
        api_activities::activities_restore,
        api_users::whoami,
        api_users::users_list,
        api_users::users_create,
        api_users::users_set_role,
        api_events::events_sse,
    ),
    components(schemas(
        crm_protocol::Lead,
        crm_protocol::Customer,
        crm_protocol::Activity,
        crm_protocol::User,
        crm_protocol::Principal,
        crm_protocol::LeadStatus,
        crm_protocol::ActivityType,
        crm_protocol::Role,
        crm_protocol::ProblemDetails,
        crm_protocol::RealtimeNotification,
    ))
)]
pub struct ApiDoc;

pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

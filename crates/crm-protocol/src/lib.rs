//! Shared wire and domain types for the CRM services.
//!
//! Timestamps are RFC3339 strings with millisecond precision; the
//! kernel and server format them uniformly. `LeadStatus` uses
//! lower-case wire values and `ActivityType` upper-case ones — the two
//! enumerations are intentionally cased differently at the boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

/// RFC7807-style error payload used at service edges.
#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Won,
    Lost,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Contacted => "contacted",
            LeadStatus::Qualified => "qualified",
            LeadStatus::Won => "won",
            LeadStatus::Lost => "lost",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    // Case-sensitive: wire values are lower-case by contract.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(LeadStatus::New),
            "contacted" => Ok(LeadStatus::Contacted),
            "qualified" => Ok(LeadStatus::Qualified),
            "won" => Ok(LeadStatus::Won),
            "lost" => Ok(LeadStatus::Lost),
            other => Err(format!("unknown lead status `{other}`")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    Call,
    Email,
    Meeting,
    Note,
    Converted,
    Lost,
    StatusChanged,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Call => "CALL",
            ActivityType::Email => "EMAIL",
            ActivityType::Meeting => "MEETING",
            ActivityType::Note => "NOTE",
            ActivityType::Converted => "CONVERTED",
            ActivityType::Lost => "LOST",
            ActivityType::StatusChanged => "STATUS_CHANGED",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CALL" => Ok(ActivityType::Call),
            "EMAIL" => Ok(ActivityType::Email),
            "MEETING" => Ok(ActivityType::Meeting),
            "NOTE" => Ok(ActivityType::Note),
            "CONVERTED" => Ok(ActivityType::Converted),
            "LOST" => Ok(ActivityType::Lost),
            "STATUS_CHANGED" => Ok(ActivityType::StatusChanged),
            other => Err(format!("unknown activity type `{other}`")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role `{other}`")),
        }
    }
}

/// Authenticated caller, normalized once at the boundary and never
/// re-derived inside domain logic.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, ToSchema)]
pub struct Principal {
    pub id: i64,
    pub role: Role,
    pub email: String,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct Lead {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub status: LeadStatus,
    pub owner_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converted_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<i64>,
    pub created: String,
    pub updated: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    pub owner_id: i64,
    pub created: String,
    pub updated: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<String>,
}

/// Append-only audit entry attached to exactly one lead or customer.
/// `when` is the logical event time, distinct from `created`.
#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct Activity {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ActivityType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(rename = "when", skip_serializing_if = "Option::is_none")]
    pub when_at: Option<String>,
    pub owner_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<i64>,
    pub created: String,
    pub updated: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub role: Role,
    pub created: String,
    pub updated: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<String>,
}

// -------- Realtime notification envelope payload --------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RealtimeEventType {
    LeadCreated,
    LeadStatusChanged,
    LeadLost,
    LeadConverted,
    UserRoleChanged,
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct RealtimeActor {
    pub id: i64,
    pub email: String,
    pub role: Role,
}

/// Best-effort admin broadcast payload. Delivery failures are invisible
/// to the operation that produced it.
#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct RealtimeNotification {
    #[serde(rename = "type")]
    pub kind: RealtimeEventType,
    pub actor: RealtimeActor,
    pub entity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<i64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub at: String,
}

// -------- Listing / pagination --------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Common list parameters. Unknown sort keys and order values fall
/// back to the listing's defaults instead of erroring; callers must
/// not rely on invalid input being rejected.
#[derive(Debug, Deserialize, Clone, Default, ToSchema)]
pub struct ListQuery {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
}

/// Activity listing parameters. `lead_id`/`customer_id` are mutually
/// exclusive scoping filters; `from`/`to` bound the logical `when`
/// event time.
#[derive(Debug, Deserialize, Clone, Default, ToSchema)]
pub struct ActivityListQuery {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<ActivityType>,
    #[serde(default)]
    pub lead_id: Option<i64>,
    #[serde(default)]
    pub customer_id: Option<i64>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct PageMeta {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
    pub sort: String,
    pub order: SortOrder,
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
}

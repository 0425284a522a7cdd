//! Canonical event topic constants shared across services.
//!
//! This crate centralizes the string constants used when publishing
//! realtime notifications so the domain core and the HTTP server stay
//! in sync. Keep this list alphabetized within sections and favor
//! dot.case names.

// Leads
pub const TOPIC_LEADS_CONVERTED: &str = "leads.converted";
pub const TOPIC_LEADS_CREATED: &str = "leads.created";
pub const TOPIC_LEADS_LOST: &str = "leads.lost";
pub const TOPIC_LEADS_STATUS_CHANGED: &str = "leads.status.changed";

// Users / admin plane
pub const TOPIC_USERS_ROLE_CHANGED: &str = "users.role.changed";

// Service lifecycle
pub const TOPIC_SERVICE_START: &str = "service.start";
pub const TOPIC_SERVICE_STOP: &str = "service.stop";

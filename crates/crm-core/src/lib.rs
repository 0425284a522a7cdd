//! Domain core: lead lifecycle, activity log and admin notification.
//!
//! Operations take an authenticated [`crm_protocol::Principal`] and go
//! through the ownership gate before touching storage. Realtime
//! notification is strictly best-effort and happens after the
//! authoritative write.

pub mod activity;
pub mod customer;
pub mod error;
pub mod lifecycle;
pub mod notify;

pub use error::CoreError;

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

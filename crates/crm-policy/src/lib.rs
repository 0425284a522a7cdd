//! Ownership policy for owned CRM records.
//!
//! One rule, applied identically to leads, customers and activities:
//! admins may mutate anything, everyone else only records they own.
//! The gate fails closed — a malformed principal id is an
//! authorization error, never a silent deny that a caller could
//! mistake for "not found".

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crm_protocol::Principal;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("forbidden: {0}")]
    Forbidden(String),
}

/// Explainable verdict for a single mutation attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decision {
    pub allow: bool,
    pub reason: String,
}

#[derive(Clone, Debug, Default)]
pub struct OwnershipPolicy;

impl OwnershipPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Pure verdict: admin bypass, otherwise owner match. A
    /// non-positive principal id can never own anything and is
    /// reported as such.
    pub fn can_mutate(&self, principal: &Principal, owner_id: i64) -> Decision {
        if principal.id <= 0 {
            return Decision {
                allow: false,
                reason: "invalid principal (missing id)".into(),
            };
        }
        if principal.is_admin() {
            return Decision {
                allow: true,
                reason: "admin".into(),
            };
        }
        if principal.id == owner_id {
            Decision {
                allow: true,
                reason: "owner".into(),
            }
        } else {
            Decision {
                allow: false,
                reason: format!("owner is #{owner_id}, caller is #{}", principal.id),
            }
        }
    }

    /// Gate used by mutating operations. Denies surface as
    /// [`PolicyError::Forbidden`] so callers cannot swallow them as a
    /// falsy result.
    pub fn ensure_can_mutate(&self, principal: &Principal, owner_id: i64) -> Result<(), PolicyError> {
        let decision = self.can_mutate(principal, owner_id);
        if decision.allow {
            Ok(())
        } else {
            Err(PolicyError::Forbidden(decision.reason))
        }
    }
}

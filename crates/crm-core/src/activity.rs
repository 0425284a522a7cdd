//! Activity audit log.
//!
//! Every entry is attached to exactly one lead or customer. Anyone
//! authenticated may log against any live record; mutating an existing
//! entry is gated on the entry's own owner.

use chrono::{DateTime, SecondsFormat, Utc};

use crm_kernel::{ActivityPatch, ActivityTarget, Kernel, NewActivity};
use crm_policy::OwnershipPolicy;
use crm_protocol::{Activity, ActivityListQuery, ActivityType, Paginated, Principal};

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct ActivityDraft {
    pub kind: ActivityType,
    pub note: Option<String>,
    pub when: Option<String>,
    pub lead_id: Option<i64>,
    pub customer_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ActivityChange {
    pub kind: Option<ActivityType>,
    pub note: Option<String>,
    pub when: Option<String>,
    pub lead_id: Option<i64>,
    pub customer_id: Option<i64>,
}

#[derive(Clone)]
pub struct ActivityLog {
    kernel: Kernel,
    policy: OwnershipPolicy,
}

fn ensure_xor(lead_id: Option<i64>, customer_id: Option<i64>) -> Result<(), CoreError> {
    if lead_id.is_some() == customer_id.is_some() {
        return Err(CoreError::Validation(
            "exactly one of lead_id or customer_id must be provided".into(),
        ));
    }
    Ok(())
}

/// Parse a caller-supplied timestamp and normalize it to the storage
/// format (UTC, millisecond RFC3339) so range filters compare cleanly.
fn parse_ts(raw: &str, field: &str) -> Result<String, CoreError> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|_| CoreError::Validation(format!("invalid {field} date")))?;
    Ok(parsed
        .with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl ActivityLog {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            policy: OwnershipPolicy::new(),
        }
    }

    pub fn append(&self, principal: &Principal, draft: &ActivityDraft) -> Result<Activity, CoreError> {
        ensure_xor(draft.lead_id, draft.customer_id)?;
        if principal.id <= 0 {
            return Err(CoreError::Forbidden("invalid token payload (missing id)".into()));
        }
        if let Some(lead_id) = draft.lead_id {
            self.kernel
                .get_lead(lead_id, false)?
                .ok_or_else(|| CoreError::NotFound("lead not found".into()))?;
        }
        if let Some(customer_id) = draft.customer_id {
            self.kernel
                .get_customer(customer_id, false)?
                .ok_or_else(|| CoreError::NotFound("customer not found".into()))?;
        }
        let when_at = draft
            .when
            .as_deref()
            .map(|raw| parse_ts(raw, "when"))
            .transpose()?;
        Ok(self.kernel.append_activity(&NewActivity {
            kind: draft.kind,
            note: draft.note.clone(),
            when_at,
            owner_id: principal.id,
            lead_id: draft.lead_id,
            customer_id: draft.customer_id,
        })?)
    }

    pub fn get(&self, id: i64) -> Result<Activity, CoreError> {
        self.kernel
            .get_activity(id, false)?
            .ok_or_else(|| CoreError::NotFound("activity not found".into()))
    }

    pub fn list(&self, query: &ActivityListQuery) -> Result<Paginated<Activity>, CoreError> {
        let mut normalized = query.clone();
        normalized.from = query
            .from
            .as_deref()
            .map(|raw| parse_ts(raw, "from"))
            .transpose()?;
        normalized.to = query
            .to
            .as_deref()
            .map(|raw| parse_ts(raw, "to"))
            .transpose()?;
        Ok(self.kernel.list_activities(&normalized)?)
    }

    pub fn update(
        &self,
        principal: &Principal,
        id: i64,
        change: &ActivityChange,
    ) -> Result<Activity, CoreError> {
        // Retargeting must still name exactly one side.
        if change.lead_id.is_some() || change.customer_id.is_some() {
            ensure_xor(change.lead_id, change.customer_id)?;
        }
        let existing = self.get(id)?;
        self.policy.ensure_can_mutate(principal, existing.owner_id)?;

        let target = if let Some(lead_id) = change.lead_id {
            self.kernel
                .get_lead(lead_id, false)?
                .ok_or_else(|| CoreError::NotFound("lead not found".into()))?;
            Some(ActivityTarget::Lead(lead_id))
        } else if let Some(customer_id) = change.customer_id {
            self.kernel
                .get_customer(customer_id, false)?
                .ok_or_else(|| CoreError::NotFound("customer not found".into()))?;
            Some(ActivityTarget::Customer(customer_id))
        } else {
            None
        };
        let when_at = change
            .when
            .as_deref()
            .map(|raw| parse_ts(raw, "when"))
            .transpose()?;
        self.kernel
            .update_activity(
                id,
                &ActivityPatch {
                    kind: change.kind,
                    note: change.note.clone(),
                    when_at,
                    target,
                },
            )?
            .ok_or_else(|| CoreError::NotFound("activity not found".into()))
    }

    pub fn soft_delete(&self, principal: &Principal, id: i64) -> Result<(), CoreError> {
        let existing = self.get(id)?;
        self.policy.ensure_can_mutate(principal, existing.owner_id)?;
        if !self.kernel.soft_delete_activity(id)? {
            return Err(CoreError::NotFound("activity not found".into()));
        }
        Ok(())
    }

    pub fn restore(&self, principal: &Principal, id: i64) -> Result<Activity, CoreError> {
        let existing = self
            .kernel
            .get_activity(id, true)?
            .ok_or_else(|| CoreError::NotFound("activity not found".into()))?;
        self.policy.ensure_can_mutate(principal, existing.owner_id)?;
        if !self.kernel.restore_activity(id)? {
            return Err(CoreError::NotFound("activity not found or not deleted".into()));
        }
        self.get(id)
    }
}

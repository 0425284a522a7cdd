//! Lead lifecycle engine.
//!
//! Leads move through `new → contacted → qualified` freely and end in
//! one of two terminal shapes: converted (customer attached, status
//! `won`) or `lost`. Conversion is the only path that attaches a
//! customer; a converted lead never changes status again and a lost
//! lead never converts. Repeating an already-applied terminal request
//! is a no-op, not an error.
//!
//! Each mutation runs the ownership gate first, then a storage
//! transition whose preconditions are re-checked at write time (a
//! concurrent transition surfaces as [`CoreError::Conflict`]), and
//! only then the best-effort admin notification.

use serde_json::json;

use crm_kernel::{Kernel, LeadPatch, NewActivity, NewCustomer, NewLead};
use crm_policy::OwnershipPolicy;
use crm_protocol::{
    ActivityType, Customer, Lead, LeadStatus, ListQuery, Paginated, Principal, RealtimeEventType,
};

use crate::error::CoreError;
use crate::notify::AdminNotifier;

#[derive(Debug, Clone)]
pub struct LeadDraft {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

/// Result of a conversion: the won lead and the customer it now points
/// at (freshly created or pre-existing on the idempotent path).
#[derive(Debug, Clone)]
pub struct ConvertOutcome {
    pub lead: Lead,
    pub customer: Customer,
}

#[derive(Clone)]
pub struct LeadLifecycle {
    kernel: Kernel,
    policy: OwnershipPolicy,
    notifier: AdminNotifier,
}

impl LeadLifecycle {
    pub fn new(kernel: Kernel, notifier: AdminNotifier) -> Self {
        Self {
            kernel,
            policy: OwnershipPolicy::new(),
            notifier,
        }
    }

    fn require_lead(&self, id: i64) -> Result<Lead, CoreError> {
        self.kernel
            .get_lead(id, false)?
            .ok_or_else(|| CoreError::NotFound("lead not found".into()))
    }

    fn notify(
        &self,
        principal: &Principal,
        kind: RealtimeEventType,
        lead_id: i64,
        message: String,
        meta: serde_json::Value,
    ) {
        let notification =
            AdminNotifier::notification(principal, kind, "lead", Some(lead_id), message, Some(meta));
        self.notifier.notify(&notification);
    }

    pub fn create(&self, principal: &Principal, draft: &LeadDraft) -> Result<Lead, CoreError> {
        if principal.id <= 0 {
            return Err(CoreError::Forbidden("invalid token payload (missing id)".into()));
        }
        let name = draft.name.trim();
        if name.is_empty() {
            return Err(CoreError::Validation("name must not be empty".into()));
        }
        let lead = self.kernel.insert_lead(&NewLead {
            name: name.to_string(),
            email: draft.email.clone(),
            phone: draft.phone.clone(),
            notes: draft.notes.clone(),
            owner_id: principal.id,
        })?;
        self.notify(
            principal,
            RealtimeEventType::LeadCreated,
            lead.id,
            format!("Lead created: {}", lead.name),
            json!({ "leadName": lead.name }),
        );
        Ok(lead)
    }

    pub fn get(&self, id: i64) -> Result<Lead, CoreError> {
        self.require_lead(id)
    }

    pub fn list(&self, query: &ListQuery) -> Result<Paginated<Lead>, CoreError> {
        Ok(self.kernel.list_leads(query)?)
    }

    pub fn update(
        &self,
        principal: &Principal,
        id: i64,
        patch: &LeadPatch,
    ) -> Result<Lead, CoreError> {
        let existing = self.require_lead(id)?;
        self.policy.ensure_can_mutate(principal, existing.owner_id)?;
        if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(CoreError::Validation("name must not be empty".into()));
        }
        self.kernel
            .update_lead(id, patch)?
            .ok_or_else(|| CoreError::NotFound("lead not found".into()))
    }

    pub fn soft_delete(&self, principal: &Principal, id: i64) -> Result<(), CoreError> {
        let existing = self.require_lead(id)?;
        self.policy.ensure_can_mutate(principal, existing.owner_id)?;
        if !self.kernel.soft_delete_lead(id)? {
            return Err(CoreError::NotFound("lead not found".into()));
        }
        Ok(())
    }

    pub fn restore(&self, principal: &Principal, id: i64) -> Result<Lead, CoreError> {
        let existing = self
            .kernel
            .get_lead(id, true)?
            .ok_or_else(|| CoreError::NotFound("lead not found".into()))?;
        self.policy.ensure_can_mutate(principal, existing.owner_id)?;
        if !self.kernel.restore_lead(id)? {
            return Err(CoreError::NotFound("lead not found or not deleted".into()));
        }
        self.require_lead(id)
    }

    /// General status transition. Converted leads are frozen; asking
    /// for the current status is a silent no-op with no audit entry.
    pub fn change_status(
        &self,
        principal: &Principal,
        id: i64,
        to: LeadStatus,
        note: Option<&str>,
    ) -> Result<Lead, CoreError> {
        let lead = self.require_lead(id)?;
        if lead.customer_id.is_some() {
            return Err(CoreError::InvalidState(
                "converted lead status cannot be changed".into(),
            ));
        }
        self.policy.ensure_can_mutate(principal, lead.owner_id)?;

        let prev = lead.status;
        if prev == to {
            return Ok(lead);
        }

        let note = note.map(str::trim).filter(|n| !n.is_empty());
        let audit_note = match note {
            Some(n) => format!("Status: {prev} → {to}. {n}"),
            None => format!("Status: {prev} → {to}"),
        };
        let (saved, _activity) = self
            .kernel
            .persist_status_change(
                id,
                prev,
                to,
                &NewActivity {
                    kind: ActivityType::StatusChanged,
                    note: Some(audit_note),
                    when_at: None,
                    owner_id: principal.id,
                    lead_id: Some(id),
                    customer_id: None,
                },
            )?
            .ok_or_else(|| CoreError::Conflict("lead was modified concurrently".into()))?;

        self.notify(
            principal,
            RealtimeEventType::LeadStatusChanged,
            saved.id,
            format!("Lead \"{}\" status: {prev} → {}", saved.name, saved.status),
            json!({
                "leadId": saved.id,
                "leadName": saved.name,
                "from": prev,
                "to": saved.status,
                "note": note,
            }),
        );
        Ok(saved)
    }

    /// Convert a lead into a customer. Lost leads never convert;
    /// already-converted leads take the idempotent path, which repairs
    /// status drift and returns the existing customer without logging
    /// or notifying again.
    pub fn convert_to_customer(
        &self,
        principal: &Principal,
        id: i64,
    ) -> Result<ConvertOutcome, CoreError> {
        let lead = self.require_lead(id)?;
        self.policy.ensure_can_mutate(principal, lead.owner_id)?;

        if let Some(customer_id) = lead.customer_id {
            // Repair only drifted rows; a consistent converted lead is
            // returned as-is without touching storage.
            let lead = if lead.status == LeadStatus::Won && lead.converted_at.is_some() {
                lead
            } else {
                self.kernel
                    .fixup_converted_won(id)?
                    .ok_or_else(|| CoreError::NotFound("lead not found".into()))?
            };
            let customer = self
                .kernel
                .get_customer(customer_id, true)?
                .ok_or_else(|| {
                    CoreError::Internal(anyhow::anyhow!(
                        "lead #{id} points at missing customer #{customer_id}"
                    ))
                })?;
            return Ok(ConvertOutcome { lead, customer });
        }

        if lead.status == LeadStatus::Lost {
            return Err(CoreError::InvalidState(
                "lead is marked as LOST and cannot be converted".into(),
            ));
        }

        // Customer inherits the lead's owner; the audit entry belongs
        // to whoever triggered the conversion.
        let draft = NewCustomer {
            name: lead.name.clone(),
            email: lead.email.clone(),
            phone: lead.phone.clone(),
            company: None,
            owner_id: lead.owner_id,
        };
        let actor_id = principal.id;
        let (saved, customer, _activity) = self
            .kernel
            .persist_conversion(id, &draft, |customer_id| NewActivity {
                kind: ActivityType::Converted,
                note: Some(format!("Converted lead #{id} to customer #{customer_id}")),
                when_at: None,
                owner_id: actor_id,
                lead_id: Some(id),
                customer_id: Some(customer_id),
            })?
            .ok_or_else(|| CoreError::Conflict("lead was modified concurrently".into()))?;

        self.notify(
            principal,
            RealtimeEventType::LeadConverted,
            saved.id,
            format!("Lead converted: {} → Customer #{}", saved.name, customer.id),
            json!({
                "leadId": saved.id,
                "leadName": saved.name,
                "customerId": customer.id,
                "customerName": customer.name,
            }),
        );
        Ok(ConvertOutcome { lead: saved, customer })
    }

    /// Mark a lead as lost. Converted leads cannot be lost; marking an
    /// already-lost lead is a no-op with no audit entry.
    pub fn mark_lost(
        &self,
        principal: &Principal,
        id: i64,
        reason: Option<&str>,
    ) -> Result<Lead, CoreError> {
        let lead = self.require_lead(id)?;
        self.policy.ensure_can_mutate(principal, lead.owner_id)?;

        if lead.customer_id.is_some() {
            return Err(CoreError::InvalidState(
                "converted lead cannot be marked as LOST".into(),
            ));
        }
        if lead.status == LeadStatus::Lost {
            return Ok(lead);
        }

        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        let audit_note = match reason {
            Some(r) => format!("Lost: {r}"),
            None => "Marked as LOST".to_string(),
        };
        let (saved, _activity) = self
            .kernel
            .persist_lost(
                id,
                &NewActivity {
                    kind: ActivityType::Lost,
                    note: Some(audit_note),
                    when_at: None,
                    owner_id: principal.id,
                    lead_id: Some(id),
                    customer_id: None,
                },
            )?
            .ok_or_else(|| CoreError::Conflict("lead was modified concurrently".into()))?;

        self.notify(
            principal,
            RealtimeEventType::LeadLost,
            saved.id,
            format!("Lead marked LOST: {}", saved.name),
            json!({
                "leadId": saved.id,
                "leadName": saved.name,
                "reason": reason,
            }),
        );
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_events::{AdminRoom, Bus};
    use crm_protocol::Role;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, LeadLifecycle, AdminRoom) {
        let dir = tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("open kernel");
        let room = AdminRoom::new(Bus::new(32), 64);
        let lifecycle = LeadLifecycle::new(kernel, AdminNotifier::new(room.clone()));
        (dir, lifecycle, room)
    }

    fn principal(id: i64, role: Role) -> Principal {
        Principal {
            id,
            role,
            email: format!("u{id}@example.com"),
        }
    }

    fn owner() -> Principal {
        principal(7, Role::User)
    }

    fn draft(name: &str) -> LeadDraft {
        LeadDraft {
            name: name.into(),
            email: Some("contact@acme.test".into()),
            phone: None,
            notes: None,
        }
    }

    #[test]
    fn create_assigns_caller_as_owner_and_notifies() {
        let (_dir, lifecycle, room) = setup();
        let lead = lifecycle.create(&owner(), &draft("Acme")).unwrap();
        assert_eq!(lead.owner_id, 7);
        assert_eq!(lead.status, LeadStatus::New);

        let buffered = room.replay_after(None);
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].kind, crm_topics::TOPIC_LEADS_CREATED);
        assert_eq!(buffered[0].payload["type"], "LEAD_CREATED");
        assert_eq!(buffered[0].payload["message"], "Lead created: Acme");
        assert_eq!(buffered[0].payload["actor"]["id"], 7);
    }

    #[test]
    fn create_rejects_blank_name() {
        let (_dir, lifecycle, _room) = setup();
        let res = lifecycle.create(&owner(), &draft("   "));
        assert!(matches!(res, Err(CoreError::Validation(_))));
    }

    #[test]
    fn change_status_writes_audit_note_and_notifies() {
        let (_dir, lifecycle, room) = setup();
        let lead = lifecycle.create(&owner(), &draft("Acme")).unwrap();
        let saved = lifecycle
            .change_status(&owner(), lead.id, LeadStatus::Contacted, Some("  left voicemail  "))
            .unwrap();
        assert_eq!(saved.status, LeadStatus::Contacted);

        let buffered = room.replay_after(None);
        let event = buffered.last().unwrap();
        assert_eq!(event.kind, crm_topics::TOPIC_LEADS_STATUS_CHANGED);
        assert_eq!(event.payload["meta"]["from"], "new");
        assert_eq!(event.payload["meta"]["to"], "contacted");
        assert_eq!(event.payload["meta"]["note"], "left voicemail");
    }

    #[test]
    fn change_status_to_current_value_is_a_silent_noop() {
        let (_dir, lifecycle, room) = setup();
        let lead = lifecycle.create(&owner(), &draft("Acme")).unwrap();
        let before = room.replay_after(None).len();
        let saved = lifecycle
            .change_status(&owner(), lead.id, LeadStatus::New, Some("ignored"))
            .unwrap();
        assert_eq!(saved.status, LeadStatus::New);
        assert_eq!(room.replay_after(None).len(), before);
    }

    #[test]
    fn non_owner_is_forbidden_and_admin_bypasses() {
        let (_dir, lifecycle, _room) = setup();
        let lead = lifecycle.create(&owner(), &draft("Acme")).unwrap();

        let res = lifecycle.change_status(
            &principal(8, Role::User),
            lead.id,
            LeadStatus::Qualified,
            None,
        );
        assert!(matches!(res, Err(CoreError::Forbidden(_))));

        let saved = lifecycle
            .change_status(&principal(1, Role::Admin), lead.id, LeadStatus::Qualified, None)
            .unwrap();
        assert_eq!(saved.status, LeadStatus::Qualified);
    }

    #[test]
    fn convert_attaches_customer_and_is_idempotent() {
        let (_dir, lifecycle, room) = setup();
        let lead = lifecycle.create(&owner(), &draft("Acme")).unwrap();

        let first = lifecycle.convert_to_customer(&owner(), lead.id).unwrap();
        assert_eq!(first.lead.status, LeadStatus::Won);
        assert_eq!(first.lead.customer_id, Some(first.customer.id));
        assert!(first.lead.converted_at.is_some());
        // customer ownership follows the lead owner
        assert_eq!(first.customer.owner_id, 7);

        let events_after_first = room.replay_after(None).len();
        let second = lifecycle.convert_to_customer(&owner(), lead.id).unwrap();
        assert_eq!(second.customer.id, first.customer.id);
        assert_eq!(second.lead.status, LeadStatus::Won);
        // no second customer, no second notification
        assert_eq!(room.replay_after(None).len(), events_after_first);
    }

    #[test]
    fn second_convert_does_not_rewrite_the_lead_row() {
        let (_dir, lifecycle, _room) = setup();
        let lead = lifecycle.create(&owner(), &draft("Acme")).unwrap();

        let first = lifecycle.convert_to_customer(&owner(), lead.id).unwrap();
        let second = lifecycle.convert_to_customer(&owner(), lead.id).unwrap();
        assert_eq!(second.lead.updated, first.lead.updated);
        assert_eq!(second.lead.converted_at, first.lead.converted_at);
        assert_eq!(second.lead.customer_id, first.lead.customer_id);
    }

    #[test]
    fn lost_lead_cannot_convert() {
        let (_dir, lifecycle, _room) = setup();
        let lead = lifecycle.create(&owner(), &draft("Acme")).unwrap();
        lifecycle.mark_lost(&owner(), lead.id, Some("ghosted")).unwrap();

        let res = lifecycle.convert_to_customer(&owner(), lead.id);
        assert!(matches!(res, Err(CoreError::InvalidState(_))));
    }

    #[test]
    fn converted_lead_is_terminal() {
        let (_dir, lifecycle, _room) = setup();
        let lead = lifecycle.create(&owner(), &draft("Acme")).unwrap();
        lifecycle.convert_to_customer(&owner(), lead.id).unwrap();

        let status = lifecycle.change_status(&owner(), lead.id, LeadStatus::Contacted, None);
        assert!(matches!(status, Err(CoreError::InvalidState(_))));
        let lost = lifecycle.mark_lost(&owner(), lead.id, None);
        assert!(matches!(lost, Err(CoreError::InvalidState(_))));
    }

    #[test]
    fn mark_lost_is_idempotent_after_first_application() {
        let (_dir, lifecycle, room) = setup();
        let lead = lifecycle.create(&owner(), &draft("Acme")).unwrap();

        lifecycle.mark_lost(&owner(), lead.id, Some("budget cut")).unwrap();
        let after_first = room.replay_after(None);
        let lost_events = after_first
            .iter()
            .filter(|e| e.kind == crm_topics::TOPIC_LEADS_LOST)
            .count();
        assert_eq!(lost_events, 1);
        assert_eq!(
            after_first.last().unwrap().payload["meta"]["reason"],
            "budget cut"
        );

        let again = lifecycle.mark_lost(&owner(), lead.id, Some("again")).unwrap();
        assert_eq!(again.status, LeadStatus::Lost);
        assert_eq!(room.replay_after(None).len(), after_first.len());
    }

    #[test]
    fn soft_deleted_lead_is_invisible_until_restored() {
        let (_dir, lifecycle, _room) = setup();
        let lead = lifecycle.create(&owner(), &draft("Acme")).unwrap();

        lifecycle.soft_delete(&owner(), lead.id).unwrap();
        assert!(matches!(lifecycle.get(lead.id), Err(CoreError::NotFound(_))));
        let listed = lifecycle.list(&ListQuery::default()).unwrap();
        assert_eq!(listed.meta.total, 0);

        let restored = lifecycle.restore(&owner(), lead.id).unwrap();
        assert!(restored.deleted.is_none());
        // restoring a live lead reports not-deleted
        let again = lifecycle.restore(&owner(), lead.id);
        assert!(matches!(again, Err(CoreError::NotFound(_))));
    }

    #[test]
    fn update_respects_ownership_and_validation() {
        let (_dir, lifecycle, _room) = setup();
        let lead = lifecycle.create(&owner(), &draft("Acme")).unwrap();

        let blank = lifecycle.update(
            &owner(),
            lead.id,
            &LeadPatch {
                name: Some("  ".into()),
                ..Default::default()
            },
        );
        assert!(matches!(blank, Err(CoreError::Validation(_))));

        let foreign = lifecycle.update(
            &principal(8, Role::User),
            lead.id,
            &LeadPatch {
                notes: Some("sneaky".into()),
                ..Default::default()
            },
        );
        assert!(matches!(foreign, Err(CoreError::Forbidden(_))));

        let updated = lifecycle
            .update(
                &owner(),
                lead.id,
                &LeadPatch {
                    notes: Some("warm intro".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.notes.as_deref(), Some("warm intro"));
    }
}

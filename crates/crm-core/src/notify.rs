//! Best-effort admin notification on top of the broadcast room.

use serde_json::Value;

use crm_events::AdminRoom;
use crm_protocol::{Principal, RealtimeActor, RealtimeEventType, RealtimeNotification};

fn topic_for(kind: RealtimeEventType) -> &'static str {
    match kind {
        RealtimeEventType::LeadCreated => crm_topics::TOPIC_LEADS_CREATED,
        RealtimeEventType::LeadStatusChanged => crm_topics::TOPIC_LEADS_STATUS_CHANGED,
        RealtimeEventType::LeadLost => crm_topics::TOPIC_LEADS_LOST,
        RealtimeEventType::LeadConverted => crm_topics::TOPIC_LEADS_CONVERTED,
        RealtimeEventType::UserRoleChanged => crm_topics::TOPIC_USERS_ROLE_CHANGED,
    }
}

/// Fire-and-forget emitter toward connected admins. No observer, no
/// delivery — the operation that produced the notification never sees
/// the difference.
#[derive(Clone)]
pub struct AdminNotifier {
    room: AdminRoom,
}

impl AdminNotifier {
    pub fn new(room: AdminRoom) -> Self {
        Self { room }
    }

    pub fn room(&self) -> &AdminRoom {
        &self.room
    }

    pub fn notify(&self, notification: &RealtimeNotification) {
        let topic = topic_for(notification.kind);
        let seq = self.room.emit(topic, notification);
        tracing::debug!(topic, seq, entity_id = ?notification.entity_id, "admin notification emitted");
    }

    /// Convenience constructor stamping the actor and emission time.
    pub fn notification(
        actor: &Principal,
        kind: RealtimeEventType,
        entity: &str,
        entity_id: Option<i64>,
        message: String,
        meta: Option<Value>,
    ) -> RealtimeNotification {
        RealtimeNotification {
            kind,
            actor: RealtimeActor {
                id: actor.id,
                email: actor.email.clone(),
                role: actor.role,
            },
            entity: entity.to_string(),
            entity_id,
            message,
            meta,
            at: crate::now_rfc3339(),
        }
    }
}

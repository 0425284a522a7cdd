//! Broadcast transport for realtime notifications.
//!
//! [`Bus`] is a plain fan-out channel of JSON envelopes. [`AdminRoom`]
//! layers the admin-only observer registry on top: subscription
//! requires an admin principal, connected observers are counted for
//! the lifetime of their guard, and a bounded ring of recent
//! envelopes supports stream resume. Publishing never fails; with no
//! observer connected the envelope is simply dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crm_protocol::Principal;

/// Minimal event envelope (RFC3339 time). `seq` is assigned by the bus
/// and strictly increases in emission order.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub seq: u64,
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// A simple broadcast bus for JSON-serializable events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
    seq: Arc<AtomicU64>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Publish an event. Send failures (no receivers) and payload
    /// serialization problems are absorbed; the envelope that was (or
    /// would have been) sent is returned for buffering by callers.
    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) -> Envelope {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val = serde_json::to_value(payload).unwrap_or_else(|err| {
            tracing::debug!(kind, %err, "event payload failed to serialize");
            serde_json::json!({"_ser": "error"})
        });
        let env = Envelope {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            time: now,
            kind: kind.to_string(),
            payload: val,
        };
        let _ = self.tx.send(env.clone());
        env
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("admin role required")]
    NotAdmin,
}

/// Registry of connected admin observers plus a bounded replay ring.
///
/// The room shares the underlying [`Bus`]; what it adds is the
/// admin-only gate on subscription and the recent-items buffer that
/// lets a reconnecting observer resume after its last seen `seq`.
#[derive(Clone)]
pub struct AdminRoom {
    bus: Bus,
    recent: Arc<Mutex<VecDeque<Envelope>>>,
    replay_cap: usize,
    observers: Arc<AtomicUsize>,
}

impl AdminRoom {
    pub fn new(bus: Bus, replay_cap: usize) -> Self {
        Self {
            bus,
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(replay_cap))),
            replay_cap: replay_cap.max(1),
            observers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Best-effort emit toward connected admins. Never fails.
    pub fn emit<T: Serialize>(&self, kind: &str, payload: &T) -> u64 {
        let env = self.bus.publish(kind, payload);
        let seq = env.seq;
        if let Ok(mut ring) = self.recent.lock() {
            if ring.len() == self.replay_cap {
                ring.pop_front();
            }
            ring.push_back(env);
        }
        seq
    }

    /// Register an admin observer. Non-admin principals are refused;
    /// the returned subscription deregisters itself on drop.
    pub fn subscribe(&self, principal: &Principal) -> Result<AdminSubscription, SubscribeError> {
        if !principal.is_admin() {
            return Err(SubscribeError::NotAdmin);
        }
        self.observers.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(principal = principal.id, "admin observer connected");
        Ok(AdminSubscription {
            rx: self.bus.subscribe(),
            observers: self.observers.clone(),
            principal_id: principal.id,
        })
    }

    /// Buffered envelopes with `seq` greater than `after` (all of the
    /// ring when `after` is `None`).
    pub fn replay_after(&self, after: Option<u64>) -> Vec<Envelope> {
        let ring = match self.recent.lock() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };
        ring.iter()
            .filter(|env| after.is_none_or(|aid| env.seq > aid))
            .cloned()
            .collect()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::SeqCst)
    }
}

pub struct AdminSubscription {
    rx: broadcast::Receiver<Envelope>,
    observers: Arc<AtomicUsize>,
    principal_id: i64,
}

impl AdminSubscription {
    pub async fn recv(&mut self) -> Result<Envelope, broadcast::error::RecvError> {
        self.rx.recv().await
    }
}

impl Drop for AdminSubscription {
    fn drop(&mut self) {
        self.observers.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(principal = self.principal_id, "admin observer disconnected");
    }
}

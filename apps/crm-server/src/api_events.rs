//! Admin realtime stream over SSE.
//!
//! Subscription is admin-only; each connection registers in the
//! observer room for its lifetime. Resume works through `after=SEQ`
//! or the standard `Last-Event-ID` header, served from the room's
//! bounded replay ring; `replay=N` tails the ring without a cursor.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use tokio_stream::StreamExt as _;

use crm_events::Envelope;

use crate::identity::require_principal;
use crate::problem::ApiError;
use crate::AppState;

#[utoipa::path(
    get,
    path = "/admin/events",
    tag = "Events",
    responses(
        (status = 200, description = "SSE stream of admin notifications"),
        (status = 403, description = "Admin role required")
    )
)]
pub async fn events_sse(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = require_principal(&state.kernel, &headers)?;
    let mut sub = state
        .room
        .subscribe(&principal)
        .map_err(|_| ApiError::forbidden("admin role required"))?;

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);
    let after = q
        .get("after")
        .cloned()
        .or(last_event_id)
        .and_then(|s| s.parse::<u64>().ok());
    let replay: Vec<Envelope> = if after.is_some() {
        state.room.replay_after(after)
    } else if let Some(n) = q.get("replay").and_then(|s| s.parse::<usize>().ok()) {
        let buffered = state.room.replay_after(None);
        let skip = buffered.len().saturating_sub(n);
        buffered.into_iter().skip(skip).collect()
    } else {
        Vec::new()
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<Envelope>(128);
    tokio::spawn(async move {
        // Track the last forwarded seq so live delivery never repeats
        // an envelope already served from the ring.
        let mut last_seq = 0u64;
        for env in replay {
            last_seq = env.seq;
            if tx.send(env).await.is_err() {
                return;
            }
        }
        while let Ok(env) = sub.recv().await {
            if env.seq <= last_seq {
                continue;
            }
            last_seq = env.seq;
            if tx.send(env).await.is_err() {
                return;
            }
        }
        // `sub` drops here, deregistering the observer.
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(|env| {
        let data = serde_json::to_string(&env).unwrap_or_else(|_| "{}".to_string());
        Result::<SseEvent, std::convert::Infallible>::Ok(
            SseEvent::default()
                .event(env.kind)
                .id(env.seq.to_string())
                .data(data),
        )
    });
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(10))
            .text("keep-alive"),
    ))
}

//! Optional status endpoint, mounted at `server.status_path` when set.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// Number of events included in the response, newest first.
const RECENT_EVENTS: usize = 10;

/// `GET <status_path>`: uptime, live hub counts, relay counters, and the
/// most recent connection events.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let hub = state.hub.snapshot().await.ok();
    let s = &state.stats;

    let now = std::time::Instant::now();
    let recent_events: Vec<Value> = s
        .recent_events()
        .await
        .iter()
        .rev()
        .take(RECENT_EVENTS)
        .map(|e| {
            json!({
                "ago_ms": u64::try_from(now.duration_since(e.timestamp).as_millis()).unwrap_or(u64::MAX),
                "event": e.event_type.as_str(),
                "detail": e.detail,
            })
        })
        .collect();

    let status = if hub.is_some() { "ok" } else { "shutting_down" };
    Json(json!({
        "status": status,
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "connections": hub.map(|h| h.connections),
        "pending": hub.map(|h| h.pending),
        "counters": {
            "calls": s.calls.load(Ordering::Relaxed),
            "replies_delivered": s.replies_delivered.load(Ordering::Relaxed),
            "replies_discarded": s.replies_discarded.load(Ordering::Relaxed),
            "timeouts": s.timeouts.load(Ordering::Relaxed),
            "connections_opened": s.connections_opened.load(Ordering::Relaxed),
            "connections_closed": s.connections_closed.load(Ordering::Relaxed),
            "requests_dropped": s.requests_dropped.load(Ordering::Relaxed),
        },
        "recent_events": recent_events,
    }))
}

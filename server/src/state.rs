//! Shared application state passed to every handler via Axum's `State` extractor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::tunnel::hub::Hub;

/// Shared application state for the relay server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Handle to the hub control loop.
    pub hub: Hub,
    /// Relay counters and recent connection-level events.
    pub stats: Arc<RelayStats>,
}

impl AppState {
    /// Build the state and spawn the hub control loop. Must be called from
    /// within a Tokio runtime.
    pub fn new(config: Config) -> Self {
        let stats = Arc::new(RelayStats::new());
        let hub = Hub::spawn(&config.tunnel, stats.clone());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            hub,
            stats,
        }
    }
}

/// Relay event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayEventType {
    ConnectionOpened,
    ConnectionClosed,
    UpgradeFailed,
    DecodeFailed,
    WriteFailed,
    ReadTimeout,
    CallTimedOut,
    ReplyDiscarded,
    RequestDropped,
}

impl RelayEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionOpened => "connection_opened",
            Self::ConnectionClosed => "connection_closed",
            Self::UpgradeFailed => "upgrade_failed",
            Self::DecodeFailed => "decode_failed",
            Self::WriteFailed => "write_failed",
            Self::ReadTimeout => "read_timeout",
            Self::CallTimedOut => "call_timed_out",
            Self::ReplyDiscarded => "reply_discarded",
            Self::RequestDropped => "request_dropped",
        }
    }
}

/// A relay lifecycle event for observability.
#[derive(Clone, Debug)]
pub struct RelayEvent {
    pub timestamp: Instant,
    pub event_type: RelayEventType,
    pub detail: String,
}

/// Maximum number of recent events to retain.
const MAX_RELAY_EVENTS: usize = 100;

/// Relay statistics: atomics for the hot path, Mutex only for the event log.
///
/// One instance is handed to the hub and every connection actor, so failure
/// paths report here as well as to `tracing`.
pub struct RelayStats {
    pub calls: AtomicU64,
    pub replies_delivered: AtomicU64,
    pub replies_discarded: AtomicU64,
    pub timeouts: AtomicU64,
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub requests_dropped: AtomicU64,
    pub events: Mutex<VecDeque<RelayEvent>>,
}

impl RelayStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            replies_delivered: AtomicU64::new(0),
            replies_discarded: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            requests_dropped: AtomicU64::new(0),
            events: Mutex::new(VecDeque::with_capacity(MAX_RELAY_EVENTS)),
        }
    }

    /// Push an event, evicting the oldest if at capacity.
    pub async fn push_event(&self, event_type: RelayEventType, detail: impl Into<String>) {
        match event_type {
            RelayEventType::ConnectionOpened => {
                self.connections_opened.fetch_add(1, Ordering::Relaxed);
            }
            RelayEventType::ConnectionClosed => {
                self.connections_closed.fetch_add(1, Ordering::Relaxed);
            }
            RelayEventType::CallTimedOut => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            RelayEventType::ReplyDiscarded => {
                self.replies_discarded.fetch_add(1, Ordering::Relaxed);
            }
            RelayEventType::RequestDropped => {
                self.requests_dropped.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        let mut events = self.events.lock().await;
        if events.len() >= MAX_RELAY_EVENTS {
            events.pop_front();
        }
        events.push_back(RelayEvent {
            timestamp: Instant::now(),
            event_type,
            detail: detail.into(),
        });
    }

    /// Copy of the retained events, oldest first.
    pub async fn recent_events(&self) -> Vec<RelayEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    /// Count of retained events of one type.
    pub async fn count(&self, event_type: RelayEventType) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

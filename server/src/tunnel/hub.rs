//! Hub: owns the live connection set and the in-flight call table.
//!
//! All mutation happens inside one control loop task. Everything else talks
//! to it through the [`Hub`] handle:
//!
//! ```text
//! HTTP handler ── call() ──► Command::Call ──► pending.insert + broadcast ──► Connection(s)
//!                                                                               │
//! HTTP handler ◄── oneshot ◄── pending.remove ◄── reply queue ◄── deliver() ◄───┘
//! ```
//!
//! A reply whose `request_id` is not pending (already answered, timed out,
//! or cancelled) is dropped. When several connections answer the same
//! request, whichever reply reaches the loop first wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::protocol::{new_request_id, Request, Response};
use crate::state::{RelayEventType, RelayStats};

/// Identity of one hub-side connection.
pub type ConnectionId = u64;

/// Errors surfaced to callers of [`Hub::call`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// No reply arrived before the caller's deadline.
    #[error("no stub replied before the deadline")]
    Timeout,
    /// The hub control loop is no longer running.
    #[error("hub is shut down")]
    Closed,
}

/// The hub's view of a connection: where to push requests, and how to
/// tell it to close.
#[derive(Clone, Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub requests: mpsc::Sender<Request>,
    pub shutdown: CancellationToken,
}

/// Point-in-time counts reported by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSnapshot {
    pub connections: usize,
    pub pending: usize,
}

enum Command {
    AddConnection(Connection),
    RemoveConnection(ConnectionId),
    Call {
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    Cancel(String),
    Snapshot(oneshot::Sender<HubSnapshot>),
}

/// Cloneable handle to the hub control loop.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
    replies: mpsc::Sender<Response>,
    shutdown: CancellationToken,
    next_connection_id: Arc<AtomicU64>,
    stats: Arc<RelayStats>,
}

impl Hub {
    /// Spawn the control loop and return a handle to it.
    pub fn spawn(config: &TunnelConfig, stats: Arc<RelayStats>) -> Self {
        let (commands, command_rx) = mpsc::channel(config.reply_queue.max(1));
        let (replies, reply_rx) = mpsc::channel(config.reply_queue.max(1));
        let shutdown = CancellationToken::new();

        let hub_loop = HubLoop {
            connections: HashMap::new(),
            pending: HashMap::new(),
            write_wait: config.write_wait(),
            stats: stats.clone(),
        };
        tokio::spawn(hub_loop.run(command_rx, reply_rx, shutdown.clone()));

        Self {
            commands,
            replies,
            shutdown,
            next_connection_id: Arc::new(AtomicU64::new(1)),
            stats,
        }
    }

    /// Relay `request` to every connection and wait up to `timeout` for the
    /// first reply carrying its correlation id.
    ///
    /// Any `request_id` already on `request` is replaced. If this future is
    /// dropped before it resolves, the pending entry is removed.
    pub async fn call(&self, mut request: Request, timeout: Duration) -> Result<Response, HubError> {
        let deadline = tokio::time::Instant::now() + timeout;
        request.request_id = new_request_id();
        let request_id = request.request_id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let queued = tokio::time::timeout_at(
            deadline,
            self.commands.send(Command::Call {
                request,
                reply: reply_tx,
            }),
        )
        .await;
        match queued {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(HubError::Closed),
            Err(_) => {
                debug!(request_id = %request_id, "Call timed out before reaching the hub");
                self.stats
                    .push_event(RelayEventType::CallTimedOut, request_id)
                    .await;
                return Err(HubError::Timeout);
            }
        }
        let mut guard = PendingGuard {
            commands: &self.commands,
            request_id: Some(request_id.clone()),
        };

        match tokio::time::timeout_at(deadline, reply_rx).await {
            Ok(Ok(response)) => {
                guard.disarm();
                Ok(response)
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(HubError::Closed)
            }
            Err(_) => {
                // The guard queues the Cancel without waiting on a full queue.
                drop(guard);
                debug!(request_id = %request_id, "Call timed out");
                self.stats
                    .push_event(RelayEventType::CallTimedOut, request_id)
                    .await;
                Err(HubError::Timeout)
            }
        }
    }

    /// Hand a reply read from a connection to the control loop.
    ///
    /// Waits while the reply queue is full, so a flood from one connection
    /// stalls only that connection's reader.
    pub async fn deliver(&self, response: Response) -> Result<(), HubError> {
        self.replies
            .send(response)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Allocate an id for a new connection.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn add_connection(&self, connection: Connection) -> Result<(), HubError> {
        self.commands
            .send(Command::AddConnection(connection))
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn remove_connection(&self, id: ConnectionId) {
        let _ = self.commands.send(Command::RemoveConnection(id)).await;
    }

    /// Ask the loop for its current connection and pending-call counts.
    pub async fn snapshot(&self) -> Result<HubSnapshot, HubError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Stop the loop. Every registered connection is told to close and every
    /// waiting caller observes [`HubError::Closed`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }
}

/// Removes the pending entry if the owning `call` future is dropped early.
struct PendingGuard<'a> {
    commands: &'a mpsc::Sender<Command>,
    request_id: Option<String>,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) -> Option<String> {
        self.request_id.take()
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let Some(id) = self.request_id.take() else {
            return;
        };
        match self.commands.try_send(Command::Cancel(id)) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                let commands = self.commands.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = commands.send(cmd).await;
                    });
                }
            }
        }
    }
}

/// Requests that may wait on one connection's full queue at a time. Beyond
/// this, a request is dropped for that connection.
pub const MAX_PARKED_SENDS: usize = 4;

/// A connection as tracked by the loop.
struct Registered {
    connection: Connection,
    parked: Arc<Semaphore>,
}

/// An in-flight call. `done` is cancelled once the entry leaves the table,
/// releasing any send still parked for it.
struct Pending {
    reply: oneshot::Sender<Response>,
    done: CancellationToken,
}

/// State owned exclusively by the control loop task.
struct HubLoop {
    connections: HashMap<ConnectionId, Registered>,
    pending: HashMap<String, Pending>,
    write_wait: Duration,
    stats: Arc<RelayStats>,
}

impl HubLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut replies: mpsc::Receiver<Response>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(response) = replies.recv() => self.on_reply(response).await,
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.on_command(cmd).await;
                }
            }
        }

        let (connections, pending) = (self.connections.len(), self.pending.len());
        for registered in self.connections.values() {
            registered.connection.shutdown.cancel();
        }
        self.connections.clear();
        for (_, entry) in self.pending.drain() {
            entry.done.cancel();
        }
        info!(connections, pending, "Hub stopped");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddConnection(connection) => {
                debug!(conn_id = connection.id, "Connection registered");
                self.connections.insert(
                    connection.id,
                    Registered {
                        connection,
                        parked: Arc::new(Semaphore::new(MAX_PARKED_SENDS)),
                    },
                );
            }
            Command::RemoveConnection(id) => {
                if self.connections.remove(&id).is_some() {
                    debug!(conn_id = id, "Connection unregistered");
                }
            }
            Command::Call { request, reply } => {
                let done = CancellationToken::new();
                let entry = Pending {
                    reply,
                    done: done.clone(),
                };
                if let Some(previous) = self.pending.insert(request.request_id.clone(), entry) {
                    previous.done.cancel();
                    warn!(request_id = %request.request_id, "Correlation id collision, previous caller dropped");
                }
                self.stats.calls.fetch_add(1, Ordering::Relaxed);
                self.broadcast(&request, &done).await;
            }
            Command::Cancel(id) => {
                self.finish(&id);
            }
            Command::Snapshot(tx) => {
                let _ = tx.send(HubSnapshot {
                    connections: self.connections.len(),
                    pending: self.pending.len(),
                });
            }
        }
    }

    /// Remove a pending entry and release sends still parked for it.
    fn finish(&mut self, request_id: &str) -> Option<oneshot::Sender<Response>> {
        let entry = self.pending.remove(request_id)?;
        entry.done.cancel();
        Some(entry.reply)
    }

    /// Offer `request` to every connection without blocking the loop on a
    /// full queue.
    ///
    /// A full queue gets at most [`MAX_PARKED_SENDS`] waiting sends; each
    /// gives up after `write_wait` or once `done` fires.
    async fn broadcast(&mut self, request: &Request, done: &CancellationToken) {
        let mut dead = Vec::new();
        let mut dropped = Vec::new();
        for registered in self.connections.values() {
            let connection = &registered.connection;
            match connection.requests.try_send(request.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(request)) => {
                    let Ok(permit) = registered.parked.clone().try_acquire_owned() else {
                        dropped.push(connection.id);
                        continue;
                    };
                    let requests = connection.requests.clone();
                    let conn_id = connection.id;
                    let write_wait = self.write_wait;
                    let done = done.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        tokio::select! {
                            () = done.cancelled() => {}
                            sent = requests.send_timeout(request, write_wait) => {
                                if sent.is_err() {
                                    warn!(conn_id, "Connection queue stalled, request not forwarded");
                                }
                            }
                        }
                    });
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(connection.id),
            }
        }
        for id in dropped {
            warn!(conn_id = id, request_id = %request.request_id, "Connection queue full, request dropped");
            self.stats
                .push_event(
                    RelayEventType::RequestDropped,
                    format!("conn {id}: {}", request.request_id),
                )
                .await;
        }
        for id in dead {
            self.connections.remove(&id);
            debug!(conn_id = id, "Dropped closed connection during broadcast");
        }
    }

    async fn on_reply(&mut self, response: Response) {
        let Some(waiter) = self.finish(&response.request_id) else {
            debug!(request_id = %response.request_id, "Reply for unknown or finished call (dropped)");
            self.stats
                .push_event(RelayEventType::ReplyDiscarded, response.request_id)
                .await;
            return;
        };
        let request_id = response.request_id.clone();
        if waiter.send(response).is_ok() {
            self.stats.replies_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!(request_id = %request_id, "Caller gone before reply could be delivered");
            self.stats
                .push_event(RelayEventType::ReplyDiscarded, request_id)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Headers;

    fn hub() -> Hub {
        Hub::spawn(&TunnelConfig::default(), Arc::new(RelayStats::new()))
    }

    fn request(method: &str, url: &str) -> Request {
        Request {
            body: Vec::new(),
            method: method.into(),
            header: Headers::new(),
            url: url.into(),
            request_id: String::new(),
        }
    }

    fn reply_to(req: &Request, status: u16, body: &str) -> Response {
        Response {
            status,
            body: body.as_bytes().to_vec(),
            header: Headers::from([("X-Stub".into(), vec!["yes".into()])]),
            request_id: req.request_id.clone(),
        }
    }

    /// Register an in-memory connection and return its request stream.
    async fn connect(hub: &Hub) -> (Connection, mpsc::Receiver<Request>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Connection {
            id: hub.next_connection_id(),
            requests: tx,
            shutdown: CancellationToken::new(),
        };
        hub.add_connection(conn.clone()).await.unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn call_returns_first_matching_reply_unmodified() {
        let hub = hub();
        let (_conn, mut rx) = connect(&hub).await;

        let responder = hub.clone();
        tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            assert_eq!(req.method, "POST");
            assert_eq!(req.url, "/orders");
            responder
                .deliver(reply_to(&req, 201, r#"{"ok":true}"#))
                .await
                .unwrap();
        });

        let resp = hub
            .call(request("POST", "/orders"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.body, br#"{"ok":true}"#);
        assert_eq!(resp.header["X-Stub"], vec!["yes".to_string()]);
        assert_eq!(hub.snapshot().await.unwrap().pending, 0);
        assert_eq!(hub.stats().replies_delivered.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn call_without_connections_times_out_and_clears_entry() {
        let hub = hub();
        let started = tokio::time::Instant::now();
        let err = hub
            .call(request("GET", "/"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, HubError::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(hub.snapshot().await.unwrap().pending, 0);
        assert_eq!(hub.stats().count(RelayEventType::CallTimedOut).await, 1);
    }

    #[tokio::test]
    async fn late_reply_is_discarded() {
        let hub = hub();
        let (_conn, mut rx) = connect(&hub).await;

        let err = hub
            .call(request("GET", "/slow"), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err, HubError::Timeout);

        let req = rx.recv().await.unwrap();
        hub.deliver(reply_to(&req, 200, "late")).await.unwrap();
        // Replies and commands use separate queues; poll for the discard.
        for _ in 0..50 {
            if hub.stats().replies_discarded.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hub.stats().replies_discarded.load(Ordering::Relaxed), 1);
        assert_eq!(hub.stats().replies_delivered.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn only_first_of_duplicate_replies_is_delivered() {
        let hub = hub();
        let (_conn, mut rx) = connect(&hub).await;

        let responder = hub.clone();
        tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            responder.deliver(reply_to(&req, 200, "first")).await.unwrap();
            responder.deliver(reply_to(&req, 500, "second")).await.unwrap();
        });

        let resp = hub
            .call(request("GET", "/dup"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"first");

        for _ in 0..50 {
            if hub.stats().replies_discarded.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hub.stats().replies_discarded.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn every_connection_receives_the_broadcast() {
        let hub = hub();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            receivers.push(connect(&hub).await.1);
        }

        let caller = hub.clone();
        let call = tokio::spawn(async move {
            caller
                .call(request("GET", "/fanout"), Duration::from_millis(100))
                .await
        });

        let mut ids = Vec::new();
        for rx in &mut receivers {
            let req = rx.recv().await.unwrap();
            assert_eq!(req.url, "/fanout");
            ids.push(req.request_id);
        }
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(call.await.unwrap().unwrap_err(), HubError::Timeout);
    }

    #[tokio::test]
    async fn removed_connection_gets_nothing() {
        let hub = hub();
        let (conn, mut rx) = connect(&hub).await;
        hub.remove_connection(conn.id).await;
        assert_eq!(hub.snapshot().await.unwrap().connections, 0);

        let _ = hub
            .call(request("GET", "/"), Duration::from_millis(20))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_connection_is_pruned_on_broadcast() {
        let hub = hub();
        let (_conn, rx) = connect(&hub).await;
        drop(rx);
        let _ = hub
            .call(request("GET", "/"), Duration::from_millis(10))
            .await;
        assert_eq!(hub.snapshot().await.unwrap().connections, 0);
    }

    #[tokio::test]
    async fn dropped_call_removes_pending_entry() {
        let hub = hub();
        let (_conn, mut rx) = connect(&hub).await;

        let caller = hub.clone();
        let task = tokio::spawn(async move {
            caller
                .call(request("GET", "/abandoned"), Duration::from_secs(30))
                .await
        });
        let req = rx.recv().await.unwrap();
        assert_eq!(hub.snapshot().await.unwrap().pending, 1);

        task.abort();
        let _ = task.await;
        assert_eq!(hub.snapshot().await.unwrap().pending, 0);

        hub.deliver(reply_to(&req, 200, "nobody listening"))
            .await
            .unwrap();
        assert_eq!(hub.stats().replies_delivered.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_are_routed_by_id() {
        let hub = hub();
        let (_conn, mut rx) = connect(&hub).await;

        let responder = hub.clone();
        tokio::spawn(async move {
            // Echo the URL back so each caller can check it got its own reply.
            while let Some(req) = rx.recv().await {
                let body = req.url.clone();
                responder.deliver(reply_to(&req, 200, &body)).await.unwrap();
            }
        });

        let mut calls = Vec::new();
        for i in 0..20 {
            let caller = hub.clone();
            calls.push(tokio::spawn(async move {
                let url = format!("/item/{i}");
                let resp = caller
                    .call(request("GET", &url), Duration::from_secs(2))
                    .await
                    .unwrap();
                (url, resp)
            }));
        }
        for call in calls {
            let (url, resp) = call.await.unwrap();
            assert_eq!(resp.body, url.as_bytes());
        }
        assert_eq!(hub.snapshot().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_connections_and_fails_callers() {
        let hub = hub();
        let (conn, _rx) = connect(&hub).await;

        let caller = hub.clone();
        let call = tokio::spawn(async move {
            caller
                .call(request("GET", "/"), Duration::from_secs(30))
                .await
        });
        // Let the call register before shutting down.
        while hub.snapshot().await.unwrap().pending == 0 {
            tokio::task::yield_now().await;
        }

        hub.shutdown();
        assert_eq!(call.await.unwrap().unwrap_err(), HubError::Closed);
        conn.shutdown.cancelled().await;
        assert!(hub.is_shut_down());
        assert_eq!(
            hub.call(request("GET", "/"), Duration::from_millis(10))
                .await
                .unwrap_err(),
            HubError::Closed
        );
    }

    #[tokio::test]
    async fn stalled_connection_parks_a_bounded_number_of_requests() {
        let hub = hub();
        // Queue of one that is never read.
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection {
            id: hub.next_connection_id(),
            requests: tx,
            shutdown: CancellationToken::new(),
        };
        hub.add_connection(conn.clone()).await.unwrap();

        let total = 40;
        let mut calls = Vec::new();
        for i in 0..total {
            let caller = hub.clone();
            let mut req = request("POST", &format!("/bulk/{i}"));
            req.body = vec![0; 64 * 1024];
            calls.push(tokio::spawn(async move {
                caller.call(req, Duration::from_secs(1)).await
            }));
        }
        while hub.stats().calls.load(Ordering::Relaxed) < total {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        hub.snapshot().await.unwrap();

        // The test and the hub each hold one sender; parked sends hold the rest.
        assert!(conn.requests.strong_count() <= 2 + MAX_PARKED_SENDS);
        assert_eq!(
            hub.stats().count(RelayEventType::RequestDropped).await,
            total as usize - 1 - MAX_PARKED_SENDS
        );
        assert_eq!(
            hub.stats().requests_dropped.load(Ordering::Relaxed),
            total - 1 - MAX_PARKED_SENDS as u64
        );

        for call in calls {
            assert_eq!(call.await.unwrap().unwrap_err(), HubError::Timeout);
        }
        // Finished calls release their parked sends without waiting out write_wait.
        for _ in 0..100 {
            if conn.requests.strong_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(conn.requests.strong_count(), 2);
    }

    #[tokio::test]
    async fn deadline_covers_a_backed_up_command_queue() {
        // A hub whose loop never drains its queue.
        let (commands, _command_rx) = mpsc::channel(1);
        let (replies, _reply_rx) = mpsc::channel(1);
        let hub = Hub {
            commands,
            replies,
            shutdown: CancellationToken::new(),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            stats: Arc::new(RelayStats::new()),
        };
        assert!(hub.commands.try_send(Command::Cancel("filler".into())).is_ok());

        let started = tokio::time::Instant::now();
        let err = hub
            .call(request("GET", "/"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, HubError::Timeout);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(hub.stats().count(RelayEventType::CallTimedOut).await, 1);
    }
}

//! Connection actor: one per stub client connected at `/subscribez`.
//!
//! Each connection runs two loops over the split WebSocket:
//!
//! - **reader**: decodes `Response` frames and hands them to the hub. Any
//!   inbound frame (pongs included) must arrive within `pong_wait`.
//! - **writer**: the only task that writes to the socket. Drains the
//!   request queue fed by the hub and sends a ping every `ping_period`.
//!   Each write must finish within `write_wait`.
//!
//! Whichever loop stops first triggers [`Closer::close`], which runs its
//! teardown exactly once and stops the other loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::TunnelConfig;
use crate::protocol::{Request, Response};
use crate::state::RelayEventType;
use crate::tunnel::hub::{Connection, ConnectionId, Hub};

/// Connection-local failures. They close the offending connection and
/// nothing else.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("read failed: {0}")]
    Read(#[source] axum::Error),
    #[error("no frame from peer within {0:?}")]
    ReadTimeout(Duration),
    #[error("write failed: {0}")]
    Write(#[source] axum::Error),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
}

impl ConnectionError {
    fn event_type(&self) -> RelayEventType {
        match self {
            Self::Decode(_) => RelayEventType::DecodeFailed,
            Self::Read(_) | Self::ReadTimeout(_) => RelayEventType::ReadTimeout,
            Self::Encode(_) | Self::Write(_) | Self::WriteTimeout(_) => RelayEventType::WriteFailed,
        }
    }
}

/// Why a loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// Peer sent a close frame or the stream ended.
    PeerClosed,
    /// The other loop closed the connection, or the hub shut down.
    Cancelled,
}

/// Exactly-once teardown shared by both loops.
struct Closer {
    id: ConnectionId,
    hub: Hub,
    done: CancellationToken,
    closed: AtomicBool,
}

impl Closer {
    /// Unregister from the hub and stop both loops. Only the first call
    /// does anything.
    async fn close(&self, outcome: Result<Stop, ConnectionError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.done.cancel();
        self.hub.remove_connection(self.id).await;

        let stats = self.hub.stats();
        match outcome {
            Ok(Stop::PeerClosed) => info!("Stub client disconnected"),
            Ok(Stop::Cancelled) => info!("Connection closed by hub"),
            Err(e) => {
                warn!(error = %e, "Connection failed");
                stats
                    .push_event(e.event_type(), format!("conn {}: {e}", self.id))
                    .await;
            }
        }
        stats
            .push_event(RelayEventType::ConnectionClosed, format!("conn {}", self.id))
            .await;
    }
}

/// Liveness parameters, resolved once per connection.
#[derive(Debug, Clone, Copy)]
struct Liveness {
    write_wait: Duration,
    pong_wait: Duration,
    ping_period: Duration,
}

/// Drive one upgraded tunnel connection until it closes.
///
/// Registers the connection with `hub`, runs the reader on the current task
/// and the writer on a spawned one, and returns after both have stopped.
pub async fn serve(socket: WebSocket, hub: Hub, config: &TunnelConfig) {
    let id = hub.next_connection_id();
    let span = info_span!("subscriber", conn_id = id);
    let liveness = Liveness {
        write_wait: config.write_wait(),
        pong_wait: config.pong_wait(),
        ping_period: config.ping_period(),
    };
    let send_queue = config.send_queue.max(1);
    run(socket, hub, id, liveness, send_queue)
        .instrument(span)
        .await;
}

async fn run(socket: WebSocket, hub: Hub, id: ConnectionId, liveness: Liveness, send_queue: usize) {
    let (requests_tx, requests_rx) = mpsc::channel::<Request>(send_queue);
    let done = CancellationToken::new();

    let connection = Connection {
        id,
        requests: requests_tx,
        shutdown: done.clone(),
    };
    if hub.add_connection(connection).await.is_err() {
        warn!("Hub is shut down, refusing connection");
        return;
    }
    hub.stats()
        .push_event(RelayEventType::ConnectionOpened, format!("conn {id}"))
        .await;
    info!("Stub client connected");

    let closer = Arc::new(Closer {
        id,
        hub,
        done,
        closed: AtomicBool::new(false),
    });
    let (sink, stream) = socket.split();

    let writer = {
        let closer = closer.clone();
        tokio::spawn(
            async move {
                let outcome = write_loop(sink, requests_rx, &closer.done, liveness).await;
                closer.close(outcome).await;
            }
            .in_current_span(),
        )
    };

    let outcome = read_loop(stream, &closer, liveness.pong_wait).await;
    closer.close(outcome).await;
    let _ = writer.await;
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    closer: &Closer,
    pong_wait: Duration,
) -> Result<Stop, ConnectionError> {
    loop {
        let frame = tokio::select! {
            () = closer.done.cancelled() => return Ok(Stop::Cancelled),
            frame = tokio::time::timeout(pong_wait, stream.next()) => frame,
        };
        let msg = match frame {
            Err(_) => return Err(ConnectionError::ReadTimeout(pong_wait)),
            Ok(None) => return Ok(Stop::PeerClosed),
            Ok(Some(Err(e))) => return Err(ConnectionError::Read(e)),
            Ok(Some(Ok(msg))) => msg,
        };

        let response: Response = match msg {
            Message::Text(text) => serde_json::from_str(text.as_str())?,
            Message::Binary(data) => serde_json::from_slice(&data)?,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                debug!(?frame, "Peer sent close frame");
                return Ok(Stop::PeerClosed);
            }
        };

        debug!(request_id = %response.request_id, status = response.status, "Reply received");
        if closer.hub.deliver(response).await.is_err() {
            return Ok(Stop::Cancelled);
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut requests: mpsc::Receiver<Request>,
    done: &CancellationToken,
    liveness: Liveness,
) -> Result<Stop, ConnectionError> {
    let start = tokio::time::Instant::now() + liveness.ping_period;
    let mut ticker = tokio::time::interval_at(start, liveness.ping_period);

    let outcome = loop {
        tokio::select! {
            () = done.cancelled() => break Ok(Stop::Cancelled),
            request = requests.recv() => {
                let Some(request) = request else { break Ok(Stop::Cancelled) };
                let text = serde_json::to_string(&request).map_err(ConnectionError::Encode)?;
                if let Err(e) = write(&mut sink, Message::Text(text.into()), liveness.write_wait).await {
                    break Err(e);
                }
                debug!(request_id = %request.request_id, "Request forwarded");
            }
            _ = ticker.tick() => {
                if let Err(e) = write(&mut sink, Message::Ping(Bytes::new()), liveness.write_wait).await {
                    break Err(e);
                }
            }
        }
    };

    if outcome.is_ok() {
        let _ = tokio::time::timeout(liveness.write_wait, sink.send(Message::Close(None))).await;
    }
    outcome
}

async fn write(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    write_wait: Duration,
) -> Result<(), ConnectionError> {
    match tokio::time::timeout(write_wait, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Write(e)),
        Err(_) => Err(ConnectionError::WriteTimeout(write_wait)),
    }
}

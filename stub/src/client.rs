//! Tunnel client: one outbound WebSocket to the hub plus the loop that owns
//! the stub registry.
//!
//! The loop is the only place stubs are stored. It reacts to three sources:
//!
//! - control messages from [`StubBuilder`] and [`StubHandle`] (add/remove)
//! - forwarded requests read from the socket
//! - the close signal from [`Client::close`] or `Drop`
//!
//! Each forwarded request is evaluated against every stub in registration
//! order, and a reply is written for each one that matches. The hub keeps
//! only the first.
//!
//! [`StubHandle`]: crate::StubHandle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::error::ClientError;
use crate::matcher::Request;
use crate::stub::{Stub, StubBuilder, StubId};
use crate::wire::{RequestFrame, ResponseFrame};

/// Path the hub serves tunnels on.
pub const SUBSCRIBE_PATH: &str = "/subscribez";

/// Time allowed for the close frame on shutdown.
const CLOSE_WAIT: Duration = Duration::from_secs(10);

/// Depth of the control queue.
const CONTROL_QUEUE: usize = 16;

/// Largest encoded reply sent by default. Matches the hub's default frame
/// limit: a 10 MiB body in base64 plus 64 KiB of envelope.
pub const DEFAULT_MAX_REPLY_BYTES: usize = 14_046_552;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Registry changes sent to the client loop.
pub(crate) enum Control {
    Add {
        stub: Stub,
        ack: oneshot::Sender<StubId>,
    },
    Remove {
        id: StubId,
        ack: oneshot::Sender<()>,
    },
}

/// A connected stub client.
///
/// Dropping the client closes the tunnel.
pub struct Client {
    control: mpsc::Sender<Control>,
    done: CancellationToken,
    closed: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Dial `{address}/subscribez` and start the client loop.
    ///
    /// `address` is the hub's base URL, `http://`, `https://`, `ws://` or
    /// `wss://`.
    pub async fn connect(address: &str) -> Result<Self, ClientError> {
        Self::connect_with_reply_limit(address, DEFAULT_MAX_REPLY_BYTES).await
    }

    /// Like [`connect`](Self::connect), for a hub whose frame limit is not
    /// the default.
    ///
    /// A reply whose encoded frame is larger than `max_reply_bytes` is
    /// logged and not sent; the hub would close the tunnel on it.
    pub async fn connect_with_reply_limit(
        address: &str,
        max_reply_bytes: usize,
    ) -> Result<Self, ClientError> {
        let url = subscribe_url(address)?;
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Connect {
                url: url.clone(),
                source: Box::new(e),
            })?;
        info!(%url, "Connected to hub");

        let (control, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let done = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));

        let client_loop = ClientLoop {
            stubs: IndexMap::new(),
            next_id: 1,
            max_reply_bytes,
        };
        let task = tokio::spawn(
            client_loop
                .run(socket, control_rx, done.clone(), closed.clone())
                .instrument(tracing::info_span!("stub_client", %url)),
        );

        Ok(Self {
            control,
            done,
            closed,
            task: Mutex::new(Some(task)),
        })
    }

    /// Start building a stub on this client.
    pub fn stub(&self) -> StubBuilder {
        StubBuilder::new(self.control.clone())
    }

    /// Stop the loop, send a close frame and close the connection.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.done.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// True once [`close`](Self::close) was called or the hub dropped the
    /// connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

/// Build the tunnel URL from a hub base address.
fn subscribe_url(address: &str) -> Result<String, ClientError> {
    let base = address.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(ClientError::InvalidAddress(address.to_string()));
    };
    Ok(format!("{ws_base}{SUBSCRIBE_PATH}"))
}

/// Why the loop stopped.
#[derive(Debug)]
enum Exit {
    /// `close()` or `Drop`.
    Closed,
    /// Hub sent a close frame or the stream ended.
    HubClosed,
    /// Transport failure.
    Failed(String),
}

/// State owned by the client loop task.
struct ClientLoop {
    stubs: IndexMap<StubId, Stub>,
    next_id: StubId,
    max_reply_bytes: usize,
}

impl ClientLoop {
    async fn run(
        mut self,
        socket: WsStream,
        mut control: mpsc::Receiver<Control>,
        done: CancellationToken,
        closed: Arc<AtomicBool>,
    ) {
        let (mut sink, mut stream) = socket.split();
        let exit = self.select_loop(&mut sink, &mut stream, &mut control, &done).await;
        closed.store(true, Ordering::Release);

        match &exit {
            Exit::Closed => {
                let _ = tokio::time::timeout(CLOSE_WAIT, sink.send(Message::Close(None))).await;
                let _ = tokio::time::timeout(CLOSE_WAIT, sink.close()).await;
                info!("Client closed");
            }
            Exit::HubClosed => info!("Hub closed the connection"),
            Exit::Failed(e) => warn!(error = %e, "Tunnel failed"),
        }
        debug!(stubs = self.stubs.len(), "Client loop stopped");
    }

    async fn select_loop(
        &mut self,
        sink: &mut SplitSink<WsStream, Message>,
        stream: &mut SplitStream<WsStream>,
        control: &mut mpsc::Receiver<Control>,
        done: &CancellationToken,
    ) -> Exit {
        loop {
            tokio::select! {
                () = done.cancelled() => return Exit::Closed,
                Some(cmd) = control.recv() => self.on_control(cmd),
                msg = stream.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!("Ignoring non-UTF-8 binary frame");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => return Exit::HubClosed,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Exit::Failed(e.to_string()),
                    };
                    let frame: RequestFrame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "Ignoring malformed request frame");
                            continue;
                        }
                    };
                    for reply in self.replies_for(&frame) {
                        let text = match serde_json::to_string(&reply) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "Failed to encode reply");
                                continue;
                            }
                        };
                        if text.len() > self.max_reply_bytes {
                            warn!(
                                request_id = %reply.request_id,
                                size = text.len(),
                                limit = self.max_reply_bytes,
                                "Reply too large for the hub, not sent"
                            );
                            continue;
                        }
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            return Exit::Failed(format!(
                                "write failed for request {}: {e}",
                                reply.request_id
                            ));
                        }
                    }
                }
            }
        }
    }

    fn on_control(&mut self, cmd: Control) {
        match cmd {
            Control::Add { stub, ack } => {
                let id = self.next_id;
                self.next_id += 1;
                self.stubs.insert(id, stub);
                debug!(stub_id = id, "Stub registered");
                let _ = ack.send(id);
            }
            Control::Remove { id, ack } => {
                if self.stubs.shift_remove(&id).is_some() {
                    debug!(stub_id = id, "Stub released");
                }
                let _ = ack.send(());
            }
        }
    }

    /// One reply per matching stub, in registration order.
    fn replies_for(&self, frame: &RequestFrame) -> Vec<ResponseFrame> {
        let request = match Request::from_frame(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(url = %frame.url, error = %e, "Cannot parse request URL");
                return Vec::new();
            }
        };
        let replies: Vec<ResponseFrame> = self
            .stubs
            .values()
            .filter(|stub| stub.matches(&request))
            .map(|stub| ResponseFrame {
                status: stub.response.status,
                body: stub.response.body.clone(),
                header: stub.response.header.clone(),
                request_id: frame.request_id.clone(),
            })
            .collect();
        debug!(
            request_id = %frame.request_id,
            method = %frame.method,
            url = %frame.url,
            matched = replies.len(),
            "Request evaluated"
        );
        replies
    }
}

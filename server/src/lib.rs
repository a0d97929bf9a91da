#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::unused_async)]

//! stubrelay library: an HTTP front end that relays every request over
//! WebSocket tunnels to connected stub clients and answers with the first
//! reply.
//!
//! - `config`: configuration loading
//! - `protocol`: wire frames exchanged over the tunnel
//! - `state`: shared handler state and relay statistics
//! - `tunnel`: hub and per-connection actors
//! - `routes`: HTTP handlers (relay fallback, tunnel upgrade, status)

pub mod config;
pub mod protocol;
pub mod routes;
pub mod state;
pub mod tunnel;

use std::future::Future;

use axum::{routing::any, routing::get, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use config::Config;
pub use protocol::{Request, Response};
pub use state::{AppState, RelayStats};
pub use tunnel::hub::{Hub, HubError};

/// Path stub clients connect to.
pub const SUBSCRIBE_PATH: &str = "/subscribez";

/// Build the application router.
///
/// `/subscribez` upgrades to a tunnel, `server.status_path` (when set)
/// answers locally, and every other path is relayed.
pub fn router(state: AppState) -> Router {
    let mut app = Router::new().route(SUBSCRIBE_PATH, any(routes::subscribe::subscribe));

    if let Some(path) = state.config.server.status_path.as_deref() {
        if !path.starts_with('/') || path == SUBSCRIBE_PATH {
            warn!(path, "Ignoring unusable status_path");
        } else {
            app = app.route(path, get(routes::status::status));
        }
    }

    app.fallback(routes::relay::relay)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the relay on `listener` until `shutdown` resolves.
///
/// Once `shutdown` fires the hub is stopped: tunnel connections are closed
/// and callers still waiting for a reply get `500`. In-flight HTTP requests
/// are then drained before this returns.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let hub = state.hub.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Stopping hub");
            hub.shutdown();
        })
        .await
}

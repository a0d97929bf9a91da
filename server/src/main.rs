#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # stubrelay
//!
//! HTTP stub relay. Every inbound HTTP request is forwarded to the stub
//! clients connected over WebSocket, and the first reply wins.
//!
//! | Method | Path                 | Description                               |
//! |--------|----------------------|-------------------------------------------|
//! | GET    | `/subscribez`        | WebSocket tunnel for stub clients         |
//! | GET    | `server.status_path` | Relay status (only when configured)       |
//! | any    | anything else        | Relayed; `408` if no stub replies in time |

use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use stubrelay::{AppState, Config};

/// HTTP stub relay.
#[derive(Parser)]
#[command(name = "stubrelay", version)]
struct Cli {
    /// Path to TOML config file (default: `stubrelay.toml` in CWD if present).
    #[arg(long)]
    config: Option<String>,
    /// Port to listen on. Overrides config and `STUBRELAY_PORT`.
    #[arg(long, short)]
    port: Option<u16>,
    /// How long to wait for a stub reply, in milliseconds.
    #[arg(long, value_name = "MS")]
    wait_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("stubrelay: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ms) = cli.wait_timeout {
        config.server.wait_timeout_ms = ms;
    }
    if let Err(e) = config.validate() {
        eprintln!("stubrelay: {e}");
        return ExitCode::FAILURE;
    }

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("stubrelay v{} starting", env!("CARGO_PKG_VERSION"));
    let addr = config.server.listen_addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!(
        %addr,
        wait_timeout_ms = config.server.wait_timeout_ms,
        status_path = config.server.status_path.as_deref().unwrap_or("-"),
        "Server ready"
    );

    let state = AppState::new(config);
    let stats = state.stats.clone();

    if let Err(e) = stubrelay::serve(listener, state, shutdown_signal()).await {
        error!(error = %e, "Server error");
        return ExitCode::FAILURE;
    }

    info!(
        calls = stats.calls.load(Ordering::Relaxed),
        delivered = stats.replies_delivered.load(Ordering::Relaxed),
        discarded = stats.replies_discarded.load(Ordering::Relaxed),
        timeouts = stats.timeouts.load(Ordering::Relaxed),
        dropped = stats.requests_dropped.load(Ordering::Relaxed),
        connections = stats.connections_opened.load(Ordering::Relaxed),
        "Goodbye"
    );
    ExitCode::SUCCESS
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to register SIGTERM handler");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

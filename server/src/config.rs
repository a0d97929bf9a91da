//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags**: `--port`, `--wait-timeout` (applied in `main`)
//! 2. **Environment variables**: `STUBRELAY_PORT`, `STUBRELAY_WAIT_TIMEOUT_MS`,
//!    `STUBRELAY_LOG`
//! 3. **Config file**: path via `--config <path>`, or `stubrelay.toml` in CWD
//! 4. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//! wait_timeout_ms = 1000
//! max_body_bytes = 10485760  # 10 MB
//! status_path = "/statusz"   # omit to relay every path
//!
//! [tunnel]
//! write_wait_ms = 10000
//! pong_wait_ms = 60000         # ping period is 9/10 of this
//! # max_message_size = 14046552  # default: base64 of max_body_bytes + 64 KiB
//! send_queue = 16
//! reply_queue = 64
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors raised while reading or parsing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
    #[error("invalid config: {field} {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Room for method, URL, headers and id around a base64 body in one frame.
pub const FRAME_ENVELOPE_BYTES: usize = 64 * 1024;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener and relay-wait settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind (default `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: String,
    /// Listening port (default 8080).
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long a relayed HTTP call waits for a stub reply, in milliseconds
    /// (default 1000). Expiry is answered with `408 Request Timeout`.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    /// Largest inbound HTTP body accepted for relaying (default 10 MB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Optional path answered locally with relay status instead of being relayed.
    #[serde(default)]
    pub status_path: Option<String>,
}

/// Liveness and queue settings for tunnel connections.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Time allowed to write one frame to a client (default 10 s).
    #[serde(default = "default_write_wait_ms")]
    pub write_wait_ms: u64,
    /// Time allowed between inbound frames, pongs included (default 60 s).
    #[serde(default = "default_pong_wait_ms")]
    pub pong_wait_ms: u64,
    /// Maximum inbound message size in bytes. Unset means large enough for a
    /// reply carrying `max_body_bytes` of body; see [`Config::max_message_size`].
    #[serde(default)]
    pub max_message_size: Option<usize>,
    /// Outbound request queue depth per connection (default 16).
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
    /// Hub reply intake queue depth (default 64).
    #[serde(default = "default_reply_queue")]
    pub reply_queue: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_wait_timeout_ms() -> u64 {
    1000
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10 MB
}
fn default_write_wait_ms() -> u64 {
    10_000
}
fn default_pong_wait_ms() -> u64 {
    60_000
}
fn default_send_queue() -> usize {
    16
}
fn default_reply_queue() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            wait_timeout_ms: default_wait_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
            status_path: None,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            write_wait_ms: default_write_wait_ms(),
            pong_wait_ms: default_pong_wait_ms(),
            max_message_size: None,
            send_queue: default_send_queue(),
            reply_queue: default_reply_queue(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Socket address string to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl TunnelConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Keepalive period: nine tenths of the peer read budget, never zero.
    pub fn ping_period(&self) -> Duration {
        (self.pong_wait() * 9 / 10).max(Duration::from_millis(1))
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `stubrelay.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("stubrelay.toml").exists() => Self::from_file("stubrelay.toml")?,
            None => Config::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with: zero timeouts, zero queue
    /// depths, or a zero frame limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("server.wait_timeout_ms", self.server.wait_timeout_ms == 0),
            ("tunnel.write_wait_ms", self.tunnel.write_wait_ms == 0),
            ("tunnel.pong_wait_ms", self.tunnel.pong_wait_ms == 0),
            ("tunnel.send_queue", self.tunnel.send_queue == 0),
            ("tunnel.reply_queue", self.tunnel.reply_queue == 0),
            ("tunnel.max_message_size", self.tunnel.max_message_size == Some(0)),
        ];
        match checks.into_iter().find(|(_, zero)| *zero) {
            Some((field, _)) => Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero",
            }),
            None => Ok(()),
        }
    }

    /// Largest tunnel frame accepted from a client. Defaults to the base64
    /// size of `max_body_bytes` plus [`FRAME_ENVELOPE_BYTES`].
    pub fn max_message_size(&self) -> usize {
        self.tunnel.max_message_size.unwrap_or_else(|| {
            self.server
                .max_body_bytes
                .div_ceil(3)
                .saturating_mul(4)
                .saturating_add(FRAME_ENVELOPE_BYTES)
        })
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply env var overrides, reading variables through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(port) = lookup("STUBRELAY_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::Env {
                var: "STUBRELAY_PORT",
                value: port,
            })?;
        }
        if let Some(ms) = lookup("STUBRELAY_WAIT_TIMEOUT_MS") {
            self.server.wait_timeout_ms = ms.parse().map_err(|_| ConfigError::Env {
                var: "STUBRELAY_WAIT_TIMEOUT_MS",
                value: ms,
            })?;
        }
        if let Some(level) = lookup("STUBRELAY_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }
}

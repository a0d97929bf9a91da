#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! Stub client for stubrelay.
//!
//! Connects to a hub's `/subscribez` tunnel and registers stubs: sets of
//! matchers with a canned response. Every HTTP request the hub receives is
//! forwarded here, and each stub whose matchers all pass sends its response
//! back.
//!
//! ```no_run
//! # async fn demo() -> Result<(), stubrelay_client::ClientError> {
//! use stubrelay_client::Client;
//!
//! let client = Client::connect("http://127.0.0.1:8080").await?;
//! let orders = client
//!     .stub()
//!     .method_post()
//!     .path("/orders")
//!     .returns_json(201, &serde_json::json!({"ok": true}))
//!     .await?;
//!
//! // ... exercise the system under test ...
//!
//! orders.release().await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
pub mod matcher;
mod stub;
mod wire;

pub use client::{Client, DEFAULT_MAX_REPLY_BYTES, SUBSCRIBE_PATH};
pub use error::ClientError;
pub use matcher::{Matcher, Request};
pub use stub::{Response, StubBuilder, StubHandle, StubId};
pub use wire::Headers;

//! HTTP route handlers.
//!
//! | Path                 | Handler                  |
//! |----------------------|--------------------------|
//! | `/subscribez`        | [`subscribe::subscribe`] |
//! | `server.status_path` | [`status::status`]       |
//! | anything else        | [`relay::relay`]         |

pub mod relay;
pub mod status;
pub mod subscribe;

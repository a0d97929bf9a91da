//! Catch-all relay handler: every request that isn't the tunnel endpoint is
//! forwarded to connected stub clients.
//!
//! | Outcome                           | HTTP status                 |
//! |-----------------------------------|-----------------------------|
//! | A stub replied in time            | the stub's status, verbatim |
//! | No reply within `wait_timeout_ms` | `408 Request Timeout`       |
//! | Anything else                     | `500 Internal Server Error` |

use axum::{
    body::Body,
    extract::{OriginalUri, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::protocol::{self, canonical_header_key, Headers};
use crate::tunnel::hub::HubError;
use crate::AppState;

/// Fallback handler. Relays the request through the hub.
pub async fn relay(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, state.config.server.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let uri = parts
        .extensions
        .get::<OriginalUri>()
        .map_or(&parts.uri, |original| &original.0);
    let url = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());

    let call = protocol::Request {
        body: body.to_vec(),
        method: parts.method.as_str().to_string(),
        header: to_wire_headers(&parts.headers),
        url,
        request_id: String::new(),
    };

    match state
        .hub
        .call(call, state.config.server.wait_timeout())
        .await
    {
        Ok(reply) => {
            debug!(request_id = %reply.request_id, status = reply.status, "Relayed reply");
            to_http_response(reply)
        }
        Err(HubError::Timeout) => StatusCode::REQUEST_TIMEOUT.into_response(),
        Err(e) => {
            warn!(error = %e, "Relay failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Convert HTTP headers to the multi-valued wire map, canonicalizing names.
/// `Host` is left out; the request URL carries only path and query.
pub fn to_wire_headers(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        if *name == axum::http::header::HOST {
            continue;
        }
        out.entry(canonical_header_key(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

/// Build the HTTP reply from a stub's response. A status or header the HTTP
/// layer cannot represent turns into a 500.
fn to_http_response(reply: protocol::Response) -> Response {
    let Ok(status) = StatusCode::from_u16(reply.status) else {
        warn!(status = reply.status, "Stub replied with an invalid status code");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let mut builder = Response::builder().status(status);
    for (name, values) in &reply.header {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    builder.body(Body::from(reply.body)).unwrap_or_else(|e| {
        warn!(error = %e, "Stub replied with an invalid header");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

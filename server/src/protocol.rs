//! Wire frames exchanged with stub clients over `/subscribez`.
//!
//! Every logical message is one JSON object in its own WebSocket frame.
//!
//! | Direction      | Frame      | Fields                                              |
//! |----------------|------------|-----------------------------------------------------|
//! | hub → client   | `Request`  | `body`, `method`, `header`, `url`, `request_id`     |
//! | client → hub   | `Response` | `status`, `body`, `header`, `request_id`            |
//!
//! Bodies are raw bytes carried as standard base64 strings. Header maps are
//! multi-valued (`{"Content-Type": ["application/json"]}`) and may be `null`.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Multi-valued header map as it appears on the wire.
pub type Headers = BTreeMap<String, Vec<String>>;

/// A forwarded HTTP request, broadcast by the hub to every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
    pub method: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub header: Headers,
    /// Request-target as received (path plus optional query).
    pub url: String,
    /// Correlation id, assigned by the hub when the call is issued.
    #[serde(default)]
    pub request_id: String,
}

/// A reply produced by a stub client for one forwarded request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub header: Headers,
    pub request_id: String,
}

/// Generate a fresh correlation id (128-bit UUIDv4 rendered as 32 hex chars).
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Canonical form of a header name: first letter and every letter after a
/// hyphen upper-cased, the rest lower-cased (`content-type` → `Content-Type`).
///
/// Names containing bytes other than letters, digits, and hyphens are
/// returned unchanged.
pub fn canonical_header_key(name: &str) -> String {
    if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
        return name.to_string();
    }
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) if !s.is_empty() => STANDARD.decode(s.as_bytes()).map_err(D::Error::custom),
            _ => Ok(Vec::new()),
        }
    }
}

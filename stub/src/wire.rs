//! Frames exchanged with the hub over `/subscribez`.
//!
//! One JSON object per WebSocket text frame. Bodies travel as standard
//! base64; header maps are multi-valued and may be `null`.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Multi-valued header map.
pub type Headers = BTreeMap<String, Vec<String>>;

/// A request forwarded by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RequestFrame {
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
    pub method: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub header: Headers,
    pub url: String,
    pub request_id: String,
}

/// A reply sent back to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ResponseFrame {
    pub status: u16,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub header: Headers,
    pub request_id: String,
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

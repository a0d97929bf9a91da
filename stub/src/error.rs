use tokio_tungstenite::tungstenite;

/// Errors returned by the stub client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The hub address is not an `http(s)://` or `ws(s)://` URL.
    #[error("unsupported hub address {0:?}: expected http(s):// or ws(s)://")]
    InvalidAddress(String),
    /// The tunnel could not be dialed or upgraded.
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },
    /// The client has been closed, or the hub dropped the connection.
    #[error("client is closed")]
    Closed,
    /// A JSON stub payload could not be serialized.
    #[error("failed to encode stub payload: {0}")]
    Encode(#[from] serde_json::Error),
}

//! Head encoding for relayed HTTP messages.
//!
//! The tunnel core treats exchange payloads as opaque bytes. The router and
//! forwarder agree on this convention on top of it: the first `ExchangeData`
//! frame of each direction carries a JSON-encoded head, every following frame
//! is a raw body chunk, and `ExchangeEnd` closes the direction.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Request line and headers of a relayed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    /// Path and query, e.g. `/api/users?page=2`.
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

/// Status and headers of a relayed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl ResponseHead {
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Headers that only make sense on one hop and must not be relayed.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

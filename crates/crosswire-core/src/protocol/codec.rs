//! Codec negotiation tokens and payload decode helpers.
//!
//! The handshake (first TCP frame, or the WebSocket sub-protocol header)
//! carries an opaque byte payload that is scanned for a recognizable codec
//! token. `proto` is checked before `json`, so a payload containing both
//! deterministically negotiates proto.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Negotiated serialization format of application payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireCodec {
    Proto,
    Json,
}

impl WireCodec {
    /// Wire name, echoed back during negotiation and usable as a WebSocket
    /// sub-protocol token.
    pub fn name(self) -> &'static str {
        match self {
            WireCodec::Proto => "proto",
            WireCodec::Json => "json",
        }
    }

    /// All tokens offered during a WebSocket upgrade.
    pub const SUBPROTOCOLS: [&'static str; 2] = ["proto", "json"];

    /// Scan a handshake payload for a codec token.
    pub fn from_token(payload: &[u8]) -> Option<Self> {
        if contains(payload, b"proto") {
            Some(WireCodec::Proto)
        } else if contains(payload, b"json") {
            Some(WireCodec::Json)
        } else {
            None
        }
    }

    /// Decode an application payload into a typed request.
    ///
    /// Payload formats are opaque to the core: JSON gets a serde convenience
    /// path; proto payloads must be interpreted by the handler itself from
    /// the raw bytes.
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            WireCodec::Json => serde_json::from_slice(data)
                .map_err(|e| Error::Decode(format!("invalid json payload: {e}"))),
            WireCodec::Proto => Err(Error::Decode(
                "proto payloads are opaque to the core; read Request::data directly".into(),
            )),
        }
    }

    /// Encode a typed response into an application payload.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Bytes> {
        match self {
            WireCodec::Json => {
                let v = serde_json::to_vec(value)
                    .map_err(|e| Error::Decode(format!("json encode failed: {e}")))?;
                Ok(Bytes::from(v))
            }
            WireCodec::Proto => Err(Error::Decode(
                "proto payloads are opaque to the core; pass raw bytes".into(),
            )),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_scan_matches_substrings() {
        assert_eq!(WireCodec::from_token(b"proto"), Some(WireCodec::Proto));
        assert_eq!(WireCodec::from_token(b"hello json v1"), Some(WireCodec::Json));
        assert_eq!(WireCodec::from_token(b"gzip"), None);
    }

    #[test]
    fn proto_wins_when_both_present() {
        assert_eq!(
            WireCodec::from_token(b"proto,json"),
            Some(WireCodec::Proto)
        );
    }
}

//! Payload serialization for RPC inputs and outputs.
//!
//! Every operation carries a serde-serializable input struct and decodes a
//! serde-deserializable output struct. [`MessageCodec`] turns them into the
//! opaque byte payloads a fabric moves; [`JsonCodec`] is the default.
//!
//! ```rust
//! use spillway_core::{JsonCodec, MessageCodec};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct HeartbeatIn { app_id: i32, client_id: i32 }
//!
//! let bytes = JsonCodec.encode(&HeartbeatIn { app_id: 1, client_id: 2 }).unwrap();
//! let back: HeartbeatIn = JsonCodec.decode(&bytes).unwrap();
//! assert_eq!(back, HeartbeatIn { app_id: 1, client_id: 2 });
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error type for codec operations.
#[derive(Debug)]
pub enum CodecError {
    /// Failed to encode a payload.
    Encode(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode a payload.
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "encode error: {}", e),
            CodecError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Encode(e) => Some(e.as_ref()),
            CodecError::Decode(e) => Some(e.as_ref()),
        }
    }
}

/// Pluggable payload serialization.
///
/// Codecs are shared by worker tasks issuing calls concurrently, hence the
/// `Send + Sync` bound.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a payload to bytes.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode a payload from bytes.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by serde_json.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

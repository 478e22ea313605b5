//! Frame bodies. Encoded with `rmp_serde::to_vec_named` so optional fields
//! can be skipped without breaking positional decoding.

use bytes::Bytes;
use gantry_core::{Metadata, Status};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::middleware::Payload;
use crate::transport::TransportError;

/// One call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub operation: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub payload: Payload,
}

/// Reply to the request with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub result: Result<Payload, Status>,
}

/// Serializes a frame body.
///
/// # Errors
///
/// Returns [`TransportError::Codec`] if the value cannot be encoded.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, TransportError> {
    rmp_serde::to_vec_named(message)
        .map(Bytes::from)
        .map_err(|e| TransportError::Codec(e.to_string()))
}

/// Deserializes a frame body.
///
/// # Errors
///
/// Returns [`TransportError::Codec`] on malformed input.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, TransportError> {
    rmp_serde::from_slice(frame).map_err(|e| TransportError::Codec(e.to_string()))
}

/// Length-prefixed framing shared by server and client.
#[must_use]
pub fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

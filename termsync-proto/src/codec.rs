//! Payload codec for `TermSync`.
//!
//! Encodes a [`Payload`] as a one-byte format version followed by its
//! postcard serialization. The engine treats the result as opaque bytes.

use crate::message::Payload;

/// Current payload format version.
pub const PAYLOAD_VERSION: u8 = 1;

/// Error type for codec encode/decode operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The input was empty.
    #[error("empty payload")]
    Empty,
    /// The version byte is not one this codec understands.
    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u8),
}

/// Encodes a [`Payload`] into a byte vector.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the payload cannot be serialized.
pub fn encode(payload: &Payload) -> Result<Vec<u8>, CodecError> {
    let mut out = vec![PAYLOAD_VERSION];
    let body =
        postcard::to_allocvec(payload).map_err(|e| CodecError::Serialization(e.to_string()))?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a [`Payload`] from a byte slice.
///
/// # Errors
///
/// Returns [`CodecError::Empty`] for an empty slice,
/// [`CodecError::UnsupportedVersion`] for an unknown version byte, or
/// [`CodecError::Serialization`] if the body cannot be deserialized.
pub fn decode(bytes: &[u8]) -> Result<Payload, CodecError> {
    let (&version, body) = bytes.split_first().ok_or(CodecError::Empty)?;
    if version != PAYLOAD_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    postcard::from_bytes(body).map_err(|e| CodecError::Serialization(e.to_string()))
}

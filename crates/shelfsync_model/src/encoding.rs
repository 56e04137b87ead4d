//! CBOR helpers for opaque serialized values.
//!
//! Structured local values (author lists, system fields, store snapshots)
//! travel as a single byte string. Encoding goes through serde so the
//! shape of the bytes is owned by the Rust type being encoded.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding CBOR.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value could not be encoded.
    #[error("CBOR encode error: {0}")]
    Encode(String),

    /// The bytes could not be decoded into the requested type.
    #[error("CBOR decode error: {0}")]
    Decode(String),
}

/// Encodes a value to CBOR bytes.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decodes a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

//! Payload encoding for event envelopes.
//!
//! Payloads are stored as JSON bytes. Domain event enums use an internally
//! tagged representation (`{"type": ..., "data": ...}`), so the bytes carry
//! their own type tag and [`peek_event_type`] can read it without knowing the
//! concrete payload type.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unsupported schema version {found} (reader supports {supported})")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },

    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encodes a payload into its stored byte form.
pub fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(payload)?)
}

/// Decodes stored bytes, refusing schema versions the reader does not know.
pub fn decode<T: DeserializeOwned>(
    bytes: &[u8],
    schema_version: u32,
    supported: u32,
) -> Result<T, CodecError> {
    if schema_version != supported {
        return Err(CodecError::UnsupportedSchemaVersion {
            found: schema_version,
            supported,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Reads the `type` tag of an encoded payload.
pub fn peek_event_type(bytes: &[u8]) -> Result<Option<String>, CodecError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    Ok(value
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_string))
}

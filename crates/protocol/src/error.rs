//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all frame decoding and encoding failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a frame.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a frame.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The frame is not a JSON object addressed to the terminal manager.
    #[error("no handler for message")]
    NoHandler,

    /// The frame is addressed correctly but its payload is unusable.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::Deserialization(format!("invalid base64 payload: {err}"))
    }
}

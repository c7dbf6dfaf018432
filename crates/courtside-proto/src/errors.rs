//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding wire frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame text was not valid JSON for any known shape.
    #[error("failed to decode frame: {0}")]
    Decode(String),

    /// Frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl ProtocolError {
    pub(crate) fn decode(err: &serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }

    pub(crate) fn encode(err: &serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

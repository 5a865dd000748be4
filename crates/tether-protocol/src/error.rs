//! Error types for envelope and frame handling.

use thiserror::Error;

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Error type for protocol operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload was not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload was JSON but not a valid JSON-RPC envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// An event-stream frame could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

impl ProtocolError {
    /// Create an invalid envelope error.
    pub fn invalid_envelope(msg: impl Into<String>) -> Self {
        Self::InvalidEnvelope(msg.into())
    }

    /// Create a malformed frame error.
    pub fn malformed_frame(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }
}

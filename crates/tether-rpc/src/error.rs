//! Error types for request handling.

use tether_protocol::{JsonRpcError, ProgressToken, ProtocolError, RequestId};
use thiserror::Error;

/// Result type for request lifecycle operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Error type for request lifecycle operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The channel or session carrying the request went away.
    #[error("channel closed")]
    ChannelClosed,

    /// No response arrived within the request timeout.
    #[error("timeout waiting for response")]
    Timeout,

    /// A progress update did not strictly increase.
    #[error("progress for token {token} must increase: last {last}, got {attempted}")]
    ProgressOrder {
        /// The progress token.
        token: ProgressToken,
        /// Last accepted value.
        last: f64,
        /// Rejected value.
        attempted: f64,
    },

    /// A request with this id is already outstanding.
    #[error("duplicate request id: {0}")]
    DuplicateRequest(RequestId),

    /// The other side answered with an error response.
    #[error("remote error: {0}")]
    Remote(JsonRpcError),

    /// The message could not be handed to the channel.
    #[error("send failed: {0}")]
    Send(String),

    /// Envelope encoding or decoding failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// Create a send error.
    pub fn send(msg: impl Into<String>) -> Self {
        Self::Send(msg.into())
    }

    /// Check whether the error means the connection is gone for good.
    pub fn is_closed(&self) -> bool {
        matches!(self, RpcError::ChannelClosed)
    }
}

/// Error returned when an inbound payload cannot be dispatched at all.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The payload was not a valid JSON-RPC envelope.
    #[error("malformed message: {0}")]
    Malformed(#[from] ProtocolError),
}

impl DispatchError {
    /// The JSON-RPC error object to report back to the sender.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        match self {
            DispatchError::Malformed(ProtocolError::Json(err)) => {
                JsonRpcError::parse_error(format!("parse error: {}", err))
            }
            DispatchError::Malformed(err) => JsonRpcError::invalid_request(err.to_string()),
        }
    }
}

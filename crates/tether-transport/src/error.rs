//! Error types for duplex channels.

use thiserror::Error;

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Error type for channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The server rejected a POST. Not retried.
    #[error("write rejected with status {status}: {body}")]
    Write {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The inbound stream dropped without the channel being closed.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The server did not answer within the configured timeout.
    #[error("timed out waiting for the server")]
    Timeout,

    /// The channel was closed deliberately.
    #[error("channel closed")]
    Closed,

    /// The server no longer knows the session.
    #[error("session not found")]
    SessionNotFound,

    /// The server cannot replay from the requested event id.
    #[error("events since the last seen id are no longer available")]
    ReplayGap,

    /// The server rejected the request as malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The server refused the request.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Any other unexpected status.
    #[error("unexpected status {0}")]
    Status(u16),

    /// A frame could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// This channel cannot resume a dropped stream.
    #[error("reconnect not supported by this channel")]
    ResumeUnsupported,

    /// The configured URL is not usable.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl ChannelError {
    /// Create a connection lost error.
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost(reason.into())
    }

    /// Create a WebSocket error.
    pub fn websocket(msg: impl Into<String>) -> Self {
        Self::WebSocket(msg.into())
    }

    /// Map a failed event-stream status to an error.
    pub fn from_stream_status(status: u16, body: String) -> Self {
        match status {
            400 => Self::BadRequest(body),
            403 => Self::Forbidden(body),
            404 => Self::SessionNotFound,
            410 => Self::ReplayGap,
            other => Self::Status(other),
        }
    }

    /// Check whether the server no longer knows the session, so only a new
    /// handshake can continue.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::SessionNotFound | Self::Write { status: 404, .. })
    }

    /// Check whether a reconnect might help.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::Http(_) | Self::Timeout
        )
    }
}

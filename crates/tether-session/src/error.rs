//! Error types for session operations.

use tether_protocol::{EventId, ProtocolError};

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session with this id exists.
    #[error("session not found: {0}")]
    NotFound(String),

    /// The session was idle past its timeout and has been removed.
    #[error("session expired: {0}")]
    Expired(String),

    /// Events after the requested id are no longer retained.
    #[error("cannot resume after event {requested}: events up to {floor} were discarded")]
    ReplayGap {
        /// Last event id the client saw.
        requested: EventId,
        /// Highest discarded event id.
        floor: EventId,
    },

    /// The session is closing or closed.
    #[error("session closed: {0}")]
    Closed(String),

    /// The session id is not a valid token.
    #[error("invalid session id")]
    InvalidId,

    /// A message could not be serialized.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Check whether the error means the session is gone.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            SessionError::NotFound(_) | SessionError::Expired(_) | SessionError::Closed(_)
        )
    }
}

//! Error types for the server.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tether_session::SessionError;
use thiserror::Error;

/// Server error type.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The request is missing a header or carries an invalid one.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The request was refused, e.g. for its origin.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown or expired session.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested events are no longer available.
    #[error("Gone: {0}")]
    Gone(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ServerError {
    /// Create a bad request error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<SessionError> for ServerError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(_) | SessionError::Expired(_) | SessionError::Closed(_) => {
                ServerError::NotFound(e.to_string())
            }
            SessionError::ReplayGap { .. } => ServerError::Gone(e.to_string()),
            SessionError::InvalidId => ServerError::BadRequest(e.to_string()),
            SessionError::Protocol(_) => ServerError::Internal(e.to_string()),
        }
    }
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ServerError::Gone(_) => (StatusCode::GONE, "replay_gap"),
            ServerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            ServerError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            ServerError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "serialization_error")
            }
        };

        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(status = %status, code, error = %message, "Server error");
        } else {
            tracing::warn!(status = %status, code, error = %message, "Client error");
        }

        let body = ErrorResponse {
            code: code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_status() {
        let cases = [
            (SessionError::NotFound("a".into()), StatusCode::NOT_FOUND),
            (SessionError::Expired("a".into()), StatusCode::NOT_FOUND),
            (
                SessionError::ReplayGap {
                    requested: 2,
                    floor: 4,
                },
                StatusCode::GONE,
            ),
            (SessionError::InvalidId, StatusCode::BAD_REQUEST),
        ];
        for (error, status) in cases {
            let response = ServerError::from(error).into_response();
            assert_eq!(response.status(), status);
        }
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = ServerError::bad_request("missing header").into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["code"], "bad_request");
        assert!(body["message"].as_str().unwrap().contains("missing header"));
    }
}

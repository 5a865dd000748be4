//! Error types for the OAuth flow.

use tether_rpc::AuthError;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, OAuthError>;

/// Errors that can occur in the OAuth flow.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// Network/HTTP error.
    #[error("Network error: {0}")]
    Network(String),

    /// The token endpoint returned an error.
    #[error("Token endpoint error: {0}")]
    Backend(String),

    /// Invalid request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No pending authorization for this state, or it expired.
    #[error("Unknown or expired state")]
    UnknownState,

    /// The redirect URI is not registered or differs from the one used to
    /// start the flow.
    #[error("Redirect URI mismatch: {0}")]
    RedirectMismatch(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for OAuthError {
    fn from(e: reqwest::Error) -> Self {
        OAuthError::Network(e.to_string())
    }
}

impl From<OAuthError> for AuthError {
    fn from(e: OAuthError) -> Self {
        match e {
            OAuthError::Network(_) | OAuthError::Backend(_) | OAuthError::Config(_) => {
                AuthError::provider(e.to_string())
            }
            OAuthError::InvalidRequest(_)
            | OAuthError::UnknownState
            | OAuthError::RedirectMismatch(_) => AuthError::invalid_credentials(e.to_string()),
        }
    }
}

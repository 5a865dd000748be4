//! Redirect URI policy.

use crate::error::{OAuthError, Result};

/// Registered redirect URIs, matched by exact string comparison.
///
/// No normalization is applied: a trailing slash, a different case or an
/// extra query parameter makes a different URI.
#[derive(Debug, Clone, Default)]
pub struct RedirectPolicy {
    allowed: Vec<String>,
}

impl RedirectPolicy {
    /// Create a policy for a set of registered URIs.
    pub fn new(allowed: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Register another URI.
    pub fn allow(mut self, uri: impl Into<String>) -> Self {
        self.allowed.push(uri.into());
        self
    }

    /// Check whether `uri` is registered.
    pub fn allows(&self, uri: &str) -> bool {
        self.allowed.iter().any(|allowed| allowed == uri)
    }

    /// Fail unless `uri` is registered.
    pub fn check(&self, uri: &str) -> Result<()> {
        if self.allows(uri) {
            Ok(())
        } else {
            Err(OAuthError::RedirectMismatch(format!("{uri} is not registered")))
        }
    }
}

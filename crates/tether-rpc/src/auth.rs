//! Authentication boundary.
//!
//! An [`AuthProvider`] turns credentials into access tokens and validates
//! bearer tokens presented with requests. Its middleware rejects requests
//! without a valid token with JSON-RPC error `-32001`.
//!
//! # Security
//!
//! [`StaticTokenProvider`] compares tokens in constant time.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tether_protocol::{JsonRpcError, JsonRpcRequest};
use thiserror::Error;

use crate::context::RequestContext;
use crate::middleware::{Middleware, Next};

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// A token issued by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    /// The bearer token value.
    pub access_token: String,
    /// Token type, normally `Bearer`.
    pub token_type: String,
    /// When the token stops being valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl AccessToken {
    /// Create a bearer token without expiry.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            access_token: token.into(),
            token_type: "Bearer".to_string(),
            expires_at: None,
            scopes: Vec::new(),
        }
    }
}

/// Identity established by validating a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Who the token was issued to.
    pub subject: String,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// When the token stops being valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Claims {
    /// Check whether the claims have expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    /// Check whether a scope was granted.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Authentication error.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// No credentials were presented.
    #[error("missing credentials")]
    MissingCredentials,

    /// Credentials were presented but rejected.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The token is unknown or does not match.
    #[error("invalid token")]
    InvalidToken,

    /// The token has expired.
    #[error("token expired")]
    Expired,

    /// The provider itself failed.
    #[error("provider error: {0}")]
    Provider(String),
}

impl AuthError {
    /// Create an invalid credentials error.
    pub fn invalid_credentials(msg: impl Into<String>) -> Self {
        Self::InvalidCredentials(msg.into())
    }

    /// Create a provider error.
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider
// ─────────────────────────────────────────────────────────────────────────────

/// Issues and validates access tokens.
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// Exchange credentials for an access token.
    async fn authenticate(&self, credentials: &Value) -> Result<AccessToken, AuthError>;

    /// Validate a bearer token.
    async fn validate_token(&self, token: &str) -> Result<Claims, AuthError>;

    /// Middleware enforcing this provider on every request.
    fn middleware(self: Arc<Self>) -> Arc<dyn Middleware>
    where
        Self: Sized,
    {
        Arc::new(AuthMiddleware::new(self))
    }
}

/// Middleware that validates the request's bearer token.
pub struct AuthMiddleware {
    provider: Arc<dyn AuthProvider>,
    public_methods: HashSet<String>,
}

impl AuthMiddleware {
    /// Create middleware for a provider.
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        Self {
            provider,
            public_methods: HashSet::new(),
        }
    }

    /// Let a method through without credentials.
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.public_methods.insert(method.into());
        self
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn call(
        &self,
        ctx: RequestContext,
        request: JsonRpcRequest,
        next: Next<'_>,
    ) -> Result<Value, JsonRpcError> {
        if self.public_methods.contains(&request.method) {
            return next.run(ctx, request).await;
        }

        let Some(token) = ctx.credentials() else {
            tracing::warn!(request_id = %ctx.request_id(), "request without credentials");
            return Err(JsonRpcError::unauthorized("missing bearer token"));
        };

        let claims = match self.provider.validate_token(token).await {
            Ok(claims) if claims.is_expired() => Err(AuthError::Expired),
            other => other,
        };

        match claims {
            Ok(claims) => {
                tracing::trace!(subject = %claims.subject, "request authenticated");
                next.run(ctx.with_claims(claims), request).await
            }
            Err(e) => {
                tracing::warn!(request_id = %ctx.request_id(), error = %e, "authentication failed");
                Err(JsonRpcError::unauthorized(e.to_string()))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Static token
// ─────────────────────────────────────────────────────────────────────────────

/// Compare two strings in constant time.
///
/// Lengths are compared first; when they differ a dummy comparison keeps
/// the timing consistent.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    if a_bytes.len() == b_bytes.len() {
        a_bytes.ct_eq(b_bytes).into()
    } else {
        let _ = a_bytes.ct_eq(a_bytes);
        false
    }
}

/// Provider accepting a single pre-shared token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
    subject: String,
}

impl StaticTokenProvider {
    /// Create a provider for a shared token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            subject: "static".to_string(),
        }
    }

    /// Set the subject reported in claims.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    /// Expects `{"token": "..."}`.
    async fn authenticate(&self, credentials: &Value) -> Result<AccessToken, AuthError> {
        let presented = credentials
            .get("token")
            .and_then(Value::as_str)
            .ok_or(AuthError::MissingCredentials)?;

        if constant_time_eq(presented, &self.token) {
            Ok(AccessToken::bearer(self.token.clone()))
        } else {
            Err(AuthError::invalid_credentials("token mismatch"))
        }
    }

    async fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        if constant_time_eq(token, &self.token) {
            Ok(Claims {
                subject: self.subject.clone(),
                scopes: Vec::new(),
                expires_at: None,
            })
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

//! [`AuthProvider`] backed by the PKCE flow.
//!
//! Tokens obtained through [`OAuthProvider::authenticate`] (or registered with
//! [`OAuthProvider::register`]) are tracked in memory until they expire or
//! are revoked.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tether_rpc::{AccessToken, AuthError, AuthProvider, Claims};

use crate::flow::{OAuthTokens, PkceFlow};

/// Auth provider that completes PKCE flows and validates the tokens it got.
#[derive(Debug)]
pub struct OAuthProvider {
    flow: PkceFlow,
    subject: String,
    issued: Mutex<HashMap<String, Claims>>,
}

impl OAuthProvider {
    /// Create a provider around a flow. Claims name the client id as subject.
    pub fn new(flow: PkceFlow) -> Self {
        let subject = format!("oauth:{}", flow.config().client_id);
        Self {
            flow,
            subject,
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// Set the subject reported in claims.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// The underlying flow, for starting authorizations.
    pub fn flow(&self) -> &PkceFlow {
        &self.flow
    }

    /// Track tokens obtained from the token endpoint.
    pub fn register(&self, tokens: &OAuthTokens) -> AccessToken {
        let claims = Claims {
            subject: self.subject.clone(),
            scopes: tokens.scopes(),
            expires_at: tokens.expires_at,
        };
        self.issued
            .lock()
            .insert(tokens.access_token.clone(), claims.clone());

        AccessToken {
            access_token: tokens.access_token.clone(),
            token_type: tokens.token_type.clone(),
            expires_at: claims.expires_at,
            scopes: claims.scopes,
        }
    }

    /// Forget a token. Returns whether it was known.
    pub fn revoke(&self, token: &str) -> bool {
        self.issued.lock().remove(token).is_some()
    }

    /// Number of tracked tokens.
    pub fn issued_count(&self) -> usize {
        self.issued.lock().len()
    }
}

fn required<'a>(credentials: &'a Value, field: &str) -> Result<&'a str, AuthError> {
    credentials
        .get(field)
        .and_then(Value::as_str)
        .ok_or(AuthError::MissingCredentials)
}

#[async_trait]
impl AuthProvider for OAuthProvider {
    /// Expects `{"code": "...", "state": "...", "redirect_uri": "..."}` as
    /// delivered to the redirect URI.
    async fn authenticate(&self, credentials: &Value) -> Result<AccessToken, AuthError> {
        let code = required(credentials, "code")?;
        let state = required(credentials, "state")?;
        let redirect_uri = required(credentials, "redirect_uri")?;

        let tokens = self.flow.complete(state, code, redirect_uri).await?;
        Ok(self.register(&tokens))
    }

    async fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut issued = self.issued.lock();
        let claims = issued.get(token).ok_or(AuthError::InvalidToken)?;
        if claims.is_expired() {
            issued.remove(token);
            tracing::debug!("dropping expired token");
            return Err(AuthError::Expired);
        }
        Ok(claims.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::OAuthConfig;
    use chrono::Utc;
    use serde_json::json;

    fn provider() -> OAuthProvider {
        let config = OAuthConfig::new(
            "client-1",
            "https://auth.example/authorize",
            "https://auth.example/token",
        )
        .with_redirect_uri("http://localhost:3000/callback");
        OAuthProvider::new(PkceFlow::new(config).unwrap())
    }

    fn tokens(access_token: &str, expires_at: Option<chrono::DateTime<Utc>>) -> OAuthTokens {
        OAuthTokens {
            access_token: access_token.to_string(),
            token_type: "Bearer".to_string(),
            expires_in: None,
            refresh_token: None,
            scope: Some("tools:call".to_string()),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_registered_token_validates() {
        let provider = provider();
        let access = provider.register(&tokens("tok-1", None));
        assert_eq!(access.scopes, vec!["tools:call"]);

        let claims = provider.validate_token("tok-1").await.unwrap();
        assert_eq!(claims.subject, "oauth:client-1");
        assert!(claims.has_scope("tools:call"));

        assert!(matches!(
            provider.validate_token("tok-2").await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_expired_token_is_dropped() {
        let provider = provider();
        provider.register(&tokens(
            "old",
            Some(Utc::now() - chrono::Duration::seconds(5)),
        ));

        assert!(matches!(
            provider.validate_token("old").await,
            Err(AuthError::Expired)
        ));
        assert_eq!(provider.issued_count(), 0);
        assert!(matches!(
            provider.validate_token("old").await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_revoke() {
        let provider = provider().with_subject("alice");
        provider.register(&tokens("tok", None));
        assert_eq!(provider.validate_token("tok").await.unwrap().subject, "alice");

        assert!(provider.revoke("tok"));
        assert!(!provider.revoke("tok"));
        assert!(provider.validate_token("tok").await.is_err());
    }

    #[tokio::test]
    async fn test_authenticate_requires_callback_fields() {
        let provider = provider();
        assert!(matches!(
            provider.authenticate(&json!({"code": "c"})).await,
            Err(AuthError::MissingCredentials)
        ));
        assert!(matches!(
            provider
                .authenticate(&json!({
                    "code": "c",
                    "state": "never-issued",
                    "redirect_uri": "http://localhost:3000/callback",
                }))
                .await,
            Err(AuthError::InvalidCredentials(_))
        ));
    }
}

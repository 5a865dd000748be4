//! Authorization code flow with PKCE.
//!
//! ```text
//! begin(redirect_uri)  ──► authorization URL + state     (verifier stored under state)
//! user authorizes      ──► redirect_uri?code=..&state=..
//! complete(state, code, redirect_uri) ──► token exchange (verifier taken, once)
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OAuthError, Result};
use crate::pkce::{PkceChallenge, generate_state};
use crate::redirect::RedirectPolicy;
use crate::store::{DEFAULT_VERIFIER_TTL, PendingAuthorization, VerifierStore};

/// Timeout for token endpoint requests.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Authorization server settings.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub authorize_url: String,
    pub token_url: String,
    pub scope: Option<String>,
    /// Registered redirect URIs.
    pub redirect_uris: Vec<String>,
    /// How long a started flow can be completed.
    pub verifier_ttl: Duration,
}

impl OAuthConfig {
    /// Create a config for a client and its authorization server.
    pub fn new(
        client_id: impl Into<String>,
        authorize_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            authorize_url: authorize_url.into(),
            token_url: token_url.into(),
            scope: None,
            redirect_uris: Vec::new(),
            verifier_ttl: DEFAULT_VERIFIER_TTL,
        }
    }

    /// Set the requested scope.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Register a redirect URI.
    pub fn with_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uris.push(uri.into());
        self
    }

    /// Set how long a started flow stays redeemable.
    pub fn with_verifier_ttl(mut self, ttl: Duration) -> Self {
        self.verifier_ttl = ttl;
        self
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("authorize_url", &self.authorize_url),
            ("token_url", &self.token_url),
        ] {
            url::Url::parse(value)
                .map_err(|e| OAuthError::Config(format!("invalid {name} {value}: {e}")))?;
        }
        if self.client_id.is_empty() {
            return Err(OAuthError::Config("client_id is empty".to_string()));
        }
        if self.redirect_uris.is_empty() {
            return Err(OAuthError::Config("no redirect URI registered".to_string()));
        }
        Ok(())
    }
}

/// Where to send the user, and the state to expect back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// OAuth tokens returned from the token exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Computed from `expires_in` when the tokens were received.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthTokens {
    /// Granted scopes, split on whitespace.
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct TokenExchangeRequest<'a> {
    grant_type: &'static str,
    code: &'a str,
    redirect_uri: &'a str,
    client_id: &'a str,
    code_verifier: &'a str,
}

/// Runs the authorization code flow for one client.
#[derive(Debug)]
pub struct PkceFlow {
    config: OAuthConfig,
    redirects: RedirectPolicy,
    verifiers: VerifierStore,
    http: reqwest::Client,
}

impl PkceFlow {
    /// Create a flow, checking the config.
    pub fn new(config: OAuthConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            redirects: RedirectPolicy::new(config.redirect_uris.iter().cloned()),
            verifiers: VerifierStore::new(config.verifier_ttl),
            config,
            http,
        })
    }

    /// The flow's configuration.
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Number of started flows not yet completed.
    pub fn pending(&self) -> usize {
        self.verifiers.len()
    }

    /// Start a flow: store a fresh verifier and build the authorization URL.
    pub fn begin(&self, redirect_uri: &str) -> Result<AuthorizationRequest> {
        self.redirects.check(redirect_uri)?;

        let pkce = PkceChallenge::generate();
        let state = generate_state();
        let url = self.authorization_url(&pkce, &state, redirect_uri);

        self.verifiers.insert(
            state.clone(),
            PendingAuthorization::new(pkce.verifier, redirect_uri),
        );
        tracing::debug!(client_id = %self.config.client_id, "authorization started");

        Ok(AuthorizationRequest { url, state })
    }

    fn authorization_url(&self, pkce: &PkceChallenge, state: &str, redirect_uri: &str) -> String {
        let mut params = vec![
            ("response_type", "code"),
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", pkce.method()),
            ("state", state),
        ];
        if let Some(scope) = &self.config.scope {
            params.push(("scope", scope.as_str()));
        }

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let separator = if self.config.authorize_url.contains('?') {
            '&'
        } else {
            '?'
        };
        format!("{}{}{}", self.config.authorize_url, separator, query)
    }

    /// Finish a flow: redeem the state's verifier and exchange the code.
    ///
    /// The state is consumed even when the exchange fails.
    pub async fn complete(&self, state: &str, code: &str, redirect_uri: &str) -> Result<OAuthTokens> {
        let pending = self.verifiers.take(state).ok_or(OAuthError::UnknownState)?;
        if pending.redirect_uri != redirect_uri {
            return Err(OAuthError::RedirectMismatch(
                "differs from the authorization request".to_string(),
            ));
        }
        self.redirects.check(redirect_uri)?;
        if code.is_empty() {
            return Err(OAuthError::InvalidRequest("missing code".to_string()));
        }

        self.exchange(code, &pending).await
    }

    async fn exchange(&self, code: &str, pending: &PendingAuthorization) -> Result<OAuthTokens> {
        let request_body = TokenExchangeRequest {
            grant_type: "authorization_code",
            code,
            redirect_uri: &pending.redirect_uri,
            client_id: &self.config.client_id,
            code_verifier: &pending.verifier,
        };

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&request_body)
            .send()
            .await
            .map_err(|e| OAuthError::Network(format!("Token exchange request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::warn!(status, "token exchange rejected");
            return Err(OAuthError::Backend(format!(
                "Token exchange failed ({}): {}",
                status, error_text
            )));
        }

        let mut tokens: OAuthTokens = response
            .json()
            .await
            .map_err(|e| OAuthError::Backend(format!("Failed to parse token response: {}", e)))?;

        tokens.expires_at = tokens
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        tracing::info!(client_id = %self.config.client_id, "authorization completed");
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OAuthConfig {
        OAuthConfig::new(
            "client-1",
            "https://auth.example/authorize",
            "https://auth.example/token",
        )
        .with_scope("read write")
        .with_redirect_uri("http://localhost:3000/callback")
    }

    #[test]
    fn test_config_validation() {
        assert!(PkceFlow::new(config()).is_ok());

        let mut bad = config();
        bad.token_url = "not a url".to_string();
        assert!(matches!(PkceFlow::new(bad), Err(OAuthError::Config(_))));

        let mut bad = config();
        bad.redirect_uris.clear();
        assert!(matches!(PkceFlow::new(bad), Err(OAuthError::Config(_))));
    }

    #[test]
    fn test_begin_builds_authorization_url() {
        let flow = PkceFlow::new(config()).unwrap();
        let request = flow.begin("http://localhost:3000/callback").unwrap();

        let url = url::Url::parse(&request.url).unwrap();
        assert_eq!(url.host_str(), Some("auth.example"));
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "client-1");
        assert_eq!(query["redirect_uri"], "http://localhost:3000/callback");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["scope"], "read write");
        assert_eq!(query["state"], request.state);
        assert_eq!(query["code_challenge"].len(), 43);
        assert_eq!(flow.pending(), 1);
    }

    #[test]
    fn test_begin_rejects_unregistered_redirect() {
        let flow = PkceFlow::new(config()).unwrap();
        assert!(matches!(
            flow.begin("http://localhost:3000/callback/"),
            Err(OAuthError::RedirectMismatch(_))
        ));
        assert_eq!(flow.pending(), 0);
    }

    #[tokio::test]
    async fn test_complete_unknown_state() {
        let flow = PkceFlow::new(config()).unwrap();
        assert!(matches!(
            flow.complete("nope", "code", "http://localhost:3000/callback")
                .await,
            Err(OAuthError::UnknownState)
        ));
    }

    #[tokio::test]
    async fn test_redirect_mismatch_consumes_state() {
        let flow = PkceFlow::new(config().with_redirect_uri("http://localhost:3000/other")).unwrap();
        let request = flow.begin("http://localhost:3000/callback").unwrap();

        assert!(matches!(
            flow.complete(&request.state, "code", "http://localhost:3000/other")
                .await,
            Err(OAuthError::RedirectMismatch(_))
        ));
        assert!(matches!(
            flow.complete(&request.state, "code", "http://localhost:3000/callback")
                .await,
            Err(OAuthError::UnknownState)
        ));
    }

    #[test]
    fn test_token_scopes() {
        let tokens: OAuthTokens =
            serde_json::from_str(r#"{"access_token":"a","scope":"read  write"}"#).unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert_eq!(tokens.scopes(), vec!["read", "write"]);
        assert!(tokens.expires_at.is_none());
    }
}

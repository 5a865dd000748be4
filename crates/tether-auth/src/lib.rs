//! OAuth 2.1 authorization code flow with mandatory PKCE.
//!
//! Plugs into a Tether server as an [`AuthProvider`](tether_rpc::AuthProvider):
//! the server hands bearer tokens to [`OAuthProvider::validate_token`], and
//! clients obtain those tokens by completing the flow.
//!
//! # Components
//!
//! - [`pkce`]: verifier/challenge generation and state tokens
//! - [`store`]: single-use verifier storage keyed by state, with a TTL
//! - [`redirect`]: exact-match redirect URI policy
//! - [`flow`]: authorization URL and token exchange
//! - [`provider`]: token tracking behind the `AuthProvider` trait

pub mod error;
pub mod flow;
pub mod pkce;
pub mod provider;
pub mod redirect;
pub mod store;

pub use error::{OAuthError, Result};
pub use flow::{AuthorizationRequest, OAuthConfig, OAuthTokens, PkceFlow};
pub use pkce::{PkceChallenge, generate_state};
pub use provider::OAuthProvider;
pub use redirect::RedirectPolicy;
pub use store::{DEFAULT_VERIFIER_TTL, PendingAuthorization, VerifierStore};

//! PKCE verifier/challenge pairs (S256) and state tokens.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// PKCE code verifier and challenge pair.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// Kept by the client until the token exchange.
    pub verifier: String,
    /// Sent with the authorization request.
    pub challenge: String,
}

impl PkceChallenge {
    /// Generate a new PKCE challenge pair from 32 random bytes.
    pub fn generate() -> Self {
        let mut verifier_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut verifier_bytes);
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
        let challenge = s256(&verifier);

        Self {
            verifier,
            challenge,
        }
    }

    /// The challenge method sent alongside the challenge.
    pub fn method(&self) -> &'static str {
        "S256"
    }

    /// Check a verifier against an S256 challenge.
    pub fn verify(verifier: &str, challenge: &str) -> bool {
        s256(verifier) == challenge
    }
}

fn s256(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate a random state string for CSRF protection.
pub fn generate_state() -> String {
    let mut state_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut state_bytes);
    URL_SAFE_NO_PAD.encode(state_bytes)
}

//! Pending authorizations keyed by state token.
//!
//! Each entry is handed out at most once: [`VerifierStore::take`] removes it
//! whether or not it is still fresh.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How long a started authorization stays redeemable.
pub const DEFAULT_VERIFIER_TTL: Duration = Duration::from_secs(10 * 60);

/// What the flow remembers between the authorization request and the
/// token exchange.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    /// PKCE verifier for the challenge that was sent.
    pub verifier: String,
    /// Redirect URI the authorization request used.
    pub redirect_uri: String,
    created_at: Instant,
}

impl PendingAuthorization {
    /// Create an entry stamped with the current time.
    pub fn new(verifier: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            verifier: verifier.into(),
            redirect_uri: redirect_uri.into(),
            created_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }
}

/// Verifier table with single-use reads and a TTL.
#[derive(Debug)]
pub struct VerifierStore {
    entries: Mutex<HashMap<String, PendingAuthorization>>,
    ttl: Duration,
}

impl Default for VerifierStore {
    fn default() -> Self {
        Self::new(DEFAULT_VERIFIER_TTL)
    }
}

impl VerifierStore {
    /// Create a store whose entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Remember a pending authorization under its state token.
    ///
    /// Expired entries are dropped on every insert.
    pub fn insert(&self, state: impl Into<String>, pending: PendingAuthorization) {
        let mut entries = self.entries.lock();
        let ttl = self.ttl;
        entries.retain(|_, entry| !entry.is_expired(ttl));
        entries.insert(state.into(), pending);
    }

    /// Remove and return the entry for `state` if it has not expired.
    pub fn take(&self, state: &str) -> Option<PendingAuthorization> {
        let entry = self.entries.lock().remove(state)?;
        if entry.is_expired(self.ttl) {
            tracing::debug!("pending authorization expired");
            return None;
        }
        Some(entry)
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| !entry.is_expired(ttl));
        before - entries.len()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

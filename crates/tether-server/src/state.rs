//! Application state shared across handlers.

use std::sync::Arc;

use tether_rpc::{Dispatcher, Handler};
use tether_session::SessionManager;

use crate::config::ServerConfig;

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,

    /// Live sessions.
    pub sessions: Arc<SessionManager>,

    /// Routes inbound messages to the handler.
    pub dispatcher: Dispatcher,
}

impl AppState {
    /// Create state for a handler.
    pub fn new(handler: impl Handler + 'static, config: ServerConfig) -> Self {
        Self {
            sessions: Arc::new(SessionManager::new(config.session.clone())),
            config: Arc::new(config),
            dispatcher: Dispatcher::new(handler),
        }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

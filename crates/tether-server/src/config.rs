//! Server configuration.
//!
//! Built in code with the `with_*` setters, or loaded from TOML:
//!
//! ```toml
//! bind_address = "127.0.0.1:8080"
//! endpoint = "/mcp"
//! allowed_origins = ["http://localhost:3000"]
//!
//! [session]
//! idle_timeout_secs = 1800
//! keepalive_interval_secs = 30
//! event_log_capacity = 1024
//! event_log_max_age_secs = 600   # 0 keeps events until evicted by count
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tether_session::{EventLogConfig, SessionConfig};

use crate::error::{Result, ServerError};

/// Default endpoint path.
pub const DEFAULT_ENDPOINT: &str = "/mcp";

/// Default port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default max body size for POST requests (4 MB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// Default max message size for WebSocket (1 MB).
pub const DEFAULT_MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to.
    pub bind_address: SocketAddr,

    /// Path of the POST/GET/DELETE endpoint. The WebSocket endpoint is
    /// this path plus `/ws`.
    pub endpoint: String,

    /// Origins allowed to talk to the server. Empty allows every origin;
    /// requests without an `Origin` header are always allowed.
    pub allowed_origins: Vec<String>,

    /// Answer CORS preflight requests.
    pub enable_cors: bool,

    /// Maximum POST body size in bytes.
    pub max_body_size: usize,

    /// Maximum WebSocket message size in bytes.
    pub max_ws_message_size: usize,

    /// Session lifecycle and event log settings.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            allowed_origins: Vec::new(),
            enable_cors: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_ws_message_size: DEFAULT_MAX_WS_MESSAGE_SIZE,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Set the endpoint path.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the allowed origins.
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    /// Enable or disable CORS.
    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.enable_cors = enabled;
        self
    }

    /// Set the maximum POST body size.
    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Set the maximum WebSocket message size.
    pub fn with_max_ws_message_size(mut self, size: usize) -> Self {
        self.max_ws_message_size = size;
        self
    }

    /// Set the session settings.
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Path of the WebSocket endpoint.
    pub fn ws_endpoint(&self) -> String {
        format!("{}/ws", self.endpoint.trim_end_matches('/'))
    }

    /// Check that the config is usable.
    pub fn validate(&self) -> Result<()> {
        if !self.endpoint.starts_with('/') {
            return Err(ServerError::Config(format!(
                "endpoint must start with '/': {}",
                self.endpoint
            )));
        }
        if self.session.event_log.capacity == 0 {
            return Err(ServerError::Config(
                "event_log_capacity must be at least 1".to_string(),
            ));
        }
        if self.session.push_buffer == 0 {
            return Err(ServerError::Config(
                "push_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(source).map_err(|e| ServerError::Config(e.to_string()))?;
        let config = file.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!(path = %path.display(), "loaded server config");
        Ok(config)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File format
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    bind_address: Option<String>,
    endpoint: String,
    allowed_origins: Vec<String>,
    enable_cors: bool,
    max_body_size: usize,
    max_ws_message_size: usize,
    session: SessionSection,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind_address: None,
            endpoint: defaults.endpoint,
            allowed_origins: defaults.allowed_origins,
            enable_cors: defaults.enable_cors,
            max_body_size: defaults.max_body_size,
            max_ws_message_size: defaults.max_ws_message_size,
            session: SessionSection::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SessionSection {
    idle_timeout_secs: u64,
    reap_interval_secs: u64,
    keepalive_interval_secs: u64,
    push_buffer: usize,
    event_log_capacity: usize,
    event_log_max_age_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
            reap_interval_secs: defaults.reap_interval.as_secs(),
            keepalive_interval_secs: defaults.keepalive_interval.as_secs(),
            push_buffer: defaults.push_buffer,
            event_log_capacity: defaults.event_log.capacity,
            event_log_max_age_secs: defaults.event_log.max_age.map_or(0, |age| age.as_secs()),
        }
    }
}

impl ConfigFile {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = ServerConfig::default();
        if let Some(addr) = self.bind_address {
            config.bind_address = addr
                .parse()
                .map_err(|e| ServerError::Config(format!("invalid bind_address {addr}: {e}")))?;
        }

        let session = self.session;
        let mut event_log = EventLogConfig::default().with_capacity(session.event_log_capacity);
        event_log = match session.event_log_max_age_secs {
            0 => event_log.without_max_age(),
            secs => event_log.with_max_age(Duration::from_secs(secs)),
        };

        config.endpoint = self.endpoint;
        config.allowed_origins = self.allowed_origins;
        config.enable_cors = self.enable_cors;
        config.max_body_size = self.max_body_size;
        config.max_ws_message_size = self.max_ws_message_size;
        config.session = SessionConfig::default()
            .with_idle_timeout(Duration::from_secs(session.idle_timeout_secs))
            .with_reap_interval(Duration::from_secs(session.reap_interval_secs))
            .with_keepalive_interval(Duration::from_secs(session.keepalive_interval_secs))
            .with_push_buffer(session.push_buffer)
            .with_event_log(event_log);
        Ok(config)
    }
}

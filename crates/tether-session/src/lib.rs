//! Session lifecycle for Tether servers.
//!
//! A [`Session`] is created by a successful handshake and owns an
//! [`EventLog`] of every message pushed to the client, a request registry
//! and at most one attached [`PushStream`]. Clients that lose their stream
//! reattach with the last event id they saw and receive what they missed.
//!
//! The [`SessionManager`] owns the session table, enforces idle expiry
//! (lazily on lookup and from a reaper task) and tears sessions down on
//! close or shutdown.

pub mod config;
pub mod error;
pub mod event_log;
pub mod manager;
pub mod push;
pub mod session;

pub use config::{
    DEFAULT_IDLE_TIMEOUT, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_LOG_CAPACITY, DEFAULT_LOG_MAX_AGE,
    DEFAULT_REAP_INTERVAL, EventLogConfig, SessionConfig,
};
pub use error::{Result, SessionError};
pub use event_log::{EventLog, EventRecord, ReplayGap};
pub use manager::SessionManager;
pub use push::{PushFrame, PushStream};
pub use session::{Session, SessionId, SessionState};

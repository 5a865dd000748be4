//! Configuration for sessions and their event logs.

use std::time::Duration;

/// Default number of events retained per session.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

/// Default maximum age of a retained event.
pub const DEFAULT_LOG_MAX_AGE: Option<Duration> = Some(Duration::from_secs(10 * 60));

/// Default idle time after which a session expires.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default interval of the expiry reaper.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Default interval between keepalive comments on an idle push stream.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of frames buffered towards an attached push stream.
pub const DEFAULT_PUSH_BUFFER: usize = 256;

/// Bounds of a session's event log.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLogConfig {
    /// Maximum number of retained events. Oldest are evicted first.
    pub capacity: usize,

    /// Events older than this are evicted on the next append or prune.
    pub max_age: Option<Duration>,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LOG_CAPACITY,
            max_age: DEFAULT_LOG_MAX_AGE,
        }
    }
}

impl EventLogConfig {
    /// Set the capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the maximum event age.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Keep events regardless of age.
    pub fn without_max_age(mut self) -> Self {
        self.max_age = None;
        self
    }
}

/// Configuration for the session manager.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Idle time after which a session expires.
    pub idle_timeout: Duration,

    /// How often the reaper looks for idle sessions.
    pub reap_interval: Duration,

    /// Keepalive interval for push streams.
    pub keepalive_interval: Duration,

    /// Frames buffered towards an attached push stream before it is
    /// considered stalled and detached.
    pub push_buffer: usize,

    /// Event log bounds for each session.
    pub event_log: EventLogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reap_interval: DEFAULT_REAP_INTERVAL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            push_buffer: DEFAULT_PUSH_BUFFER,
            event_log: EventLogConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the reaper interval.
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Set the keepalive interval.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the push buffer size.
    pub fn with_push_buffer(mut self, frames: usize) -> Self {
        self.push_buffer = frames.max(1);
        self
    }

    /// Set the event log bounds.
    pub fn with_event_log(mut self, event_log: EventLogConfig) -> Self {
        self.event_log = event_log;
        self
    }
}

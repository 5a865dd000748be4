//! Session table and lifecycle management.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tether_protocol::EventId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::push::PushStream;
use crate::session::{Session, SessionId};

/// Owns every live session.
///
/// Sessions idle past the configured timeout are expired when they are
/// next looked up, or by the reaper task, whichever comes first.
#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    config: SessionConfig,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionManager {
    /// Create a manager.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// The manager configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Allocate a new session in the `Created` state.
    pub fn create(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(SessionId::generate(), &self.config));
        self.sessions
            .write()
            .insert(session.id().clone(), session.clone());
        info!(session_id = %session.id(), "session created");
        session
    }

    /// Look up a session and record activity on it.
    ///
    /// A session found idle past the timeout is expired and removed, and
    /// reported as [`SessionError::Expired`]; later lookups report
    /// [`SessionError::NotFound`].
    pub fn get(&self, id: &str) -> Result<Arc<Session>> {
        let session = self
            .sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if session.is_idle(self.config.idle_timeout) {
            self.remove(id);
            session.expire();
            return Err(SessionError::Expired(id.to_string()));
        }

        session.touch();
        Ok(session)
    }

    /// Attach a push stream to an existing session.
    pub fn resume(&self, id: &str, last_event_id: Option<EventId>) -> Result<PushStream> {
        self.get(id)?.attach(last_event_id)
    }

    /// Remove a session from the table without closing it.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().remove(id)
    }

    /// Close and remove a session.
    pub fn close(&self, id: &str) -> Result<()> {
        let session = self
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.close();
        Ok(())
    }

    /// Expire every idle session. Returns how many were expired.
    pub fn reap_expired(&self) -> usize {
        let idle: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, session)| session.is_idle(self.config.idle_timeout))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &idle {
            session.expire();
        }
        if !idle.is_empty() {
            debug!(expired = idle.len(), "reaped idle sessions");
        }
        idle.len()
    }

    /// Run [`reap_expired`](Self::reap_expired) every reap interval until
    /// `cancel` fires.
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        manager.reap_expired();
                    }
                }
            }
            debug!("session reaper stopped");
        })
    }

    /// Close every session.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.close();
        }
        info!(closed = sessions.len(), "session manager shut down");
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Check if there are no live sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

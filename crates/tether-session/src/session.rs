//! A single client session.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use tether_protocol::{EventId, Message};
use tether_rpc::{ChannelContext, MessageSink, Peer, RequestRegistry, RpcError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::event_log::{EventLog, EventRecord};
use crate::push::{PushFrame, PushStream};

// ─────────────────────────────────────────────────────────────────────────────
// Session ID
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque session identifier carried in `Mcp-Session-Id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new random session id.
    ///
    /// 32 bytes from the thread-local CSPRNG, URL-safe base64 without
    /// padding (43 characters).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Parse a session id received from a client.
    ///
    /// Only visible ASCII (0x21 to 0x7E) is accepted.
    pub fn parse(value: &str) -> Result<Self> {
        if value.is_empty() || !value.bytes().all(|b| (0x21..=0x7e).contains(&b)) {
            return Err(SessionError::InvalidId);
        }
        Ok(Self(value.to_string()))
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Allocated, handshake in progress.
    Created,
    /// Handshake completed.
    Active,
    /// Closing; no new pushes accepted.
    Draining,
    /// Closed explicitly or by shutdown.
    Closed,
    /// Removed after idling past the timeout.
    Expired,
}

impl SessionState {
    /// Check whether pushes are accepted in this state.
    pub fn accepts_pushes(&self) -> bool {
        matches!(self, SessionState::Created | SessionState::Active)
    }
}

struct Attached {
    generation: u64,
    tx: mpsc::Sender<PushFrame>,
}

struct SessionInner {
    state: SessionState,
    last_activity: Instant,
    log: EventLog,
    channel: Option<Attached>,
    delivered_through: EventId,
    next_generation: u64,
}

impl SessionInner {
    fn deliver(&mut self, session_id: &SessionId, record: EventRecord) {
        let Some(attached) = &self.channel else {
            return;
        };
        let id = record.id;
        match attached.tx.try_send(PushFrame::Event(record)) {
            Ok(()) => {
                self.delivered_through = id;
                self.last_activity = Instant::now();
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session_id = %session_id, event_id = id, "push stream stalled, detaching");
                self.channel = None;
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(session_id = %session_id, "push stream gone, detaching");
                self.channel = None;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// One client session.
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    push_buffer: usize,
    registry: Arc<RequestRegistry>,
    inner: Mutex<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session in the `Created` state.
    pub fn new(id: SessionId, config: &SessionConfig) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            push_buffer: config.push_buffer.max(1),
            registry: Arc::new(RequestRegistry::new()),
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                last_activity: Instant::now(),
                log: EventLog::new(config.event_log.clone()),
                channel: None,
                delivered_through: 0,
                next_generation: 0,
            }),
        }
    }

    /// The session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// When the session was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// The session's request registry.
    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    /// Mark the handshake as completed.
    pub fn activate(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Created {
            inner.state = SessionState::Active;
            inner.last_activity = Instant::now();
            tracing::info!(session_id = %self.id, "session active");
        }
    }

    /// Record client activity.
    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    /// Check whether the session has been idle for at least `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.inner.lock().last_activity.elapsed() >= timeout
    }

    /// Check whether a push stream is attached.
    pub fn is_attached(&self) -> bool {
        self.inner.lock().channel.is_some()
    }

    /// Id of the newest logged event, or 0.
    pub fn last_event_id(&self) -> EventId {
        self.inner.lock().log.newest()
    }

    /// Log a message and send it to the attached stream, if any.
    ///
    /// With no stream attached the event waits in the log. A stalled or
    /// vanished stream is detached; the client catches up by resuming.
    pub fn push(&self, message: &Message) -> Result<EventId> {
        let payload = message.to_json()?;

        let mut inner = self.inner.lock();
        if !inner.state.accepts_pushes() {
            return Err(SessionError::Closed(self.id.to_string()));
        }

        let id = inner.log.append(payload);
        if let Some(record) = inner.log.latest().cloned() {
            inner.deliver(&self.id, record);
        }
        tracing::trace!(session_id = %self.id, event_id = id, "event pushed");
        Ok(id)
    }

    /// Attach a new push stream, replacing any previous one.
    ///
    /// With `last_event_id`, events after it are replayed and a gap fails
    /// the attach. Without it, every event not yet delivered to any stream
    /// is replayed.
    pub fn attach(self: &Arc<Self>, last_event_id: Option<EventId>) -> Result<PushStream> {
        let mut inner = self.inner.lock();
        if !inner.state.accepts_pushes() {
            return Err(SessionError::Closed(self.id.to_string()));
        }

        let replay = match last_event_id {
            Some(last) => inner.log.replay_from(last).map_err(|gap| {
                tracing::warn!(
                    session_id = %self.id,
                    requested = gap.requested,
                    floor = gap.floor,
                    newest = gap.newest,
                    "replay gap"
                );
                SessionError::ReplayGap {
                    requested: gap.requested,
                    floor: gap.floor,
                }
            })?,
            None => inner.log.records_after(inner.delivered_through),
        };

        let (tx, rx) = mpsc::channel(self.push_buffer + replay.len());
        let replayed = replay.len();
        for record in replay {
            let id = record.id;
            // Capacity covers the whole replay.
            if tx.try_send(PushFrame::Event(record)).is_ok() {
                inner.delivered_through = inner.delivered_through.max(id);
            }
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.channel = Some(Attached { generation, tx });
        inner.last_activity = Instant::now();

        tracing::debug!(
            session_id = %self.id,
            last_event_id = ?last_event_id,
            replayed,
            "push stream attached"
        );
        Ok(PushStream::new(rx, Arc::downgrade(self), generation))
    }

    /// Record a keepalive sent on the given stream generation.
    ///
    /// Counts as activity only while that stream is still attached.
    pub(crate) fn keepalive(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner
            .channel
            .as_ref()
            .is_some_and(|attached| attached.generation == generation)
        {
            inner.last_activity = Instant::now();
        }
    }

    /// Detach the push stream if it is still the given generation.
    pub(crate) fn detach(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner
            .channel
            .as_ref()
            .is_some_and(|attached| attached.generation == generation)
        {
            inner.channel = None;
            tracing::debug!(session_id = %self.id, "push stream detached");
        }
    }

    /// Close the session.
    ///
    /// Frames already queued on the attached stream are still delivered;
    /// the stream ends after them.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SessionState::Closed | SessionState::Expired) {
                return;
            }
            inner.state = SessionState::Draining;
            inner.channel = None;
        }

        self.registry.release_all();

        let mut inner = self.inner.lock();
        inner.log.clear();
        inner.state = SessionState::Closed;
        tracing::info!(session_id = %self.id, "session closed");
    }

    /// Expire the session after an idle timeout.
    pub fn expire(&self) {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SessionState::Closed | SessionState::Expired) {
                return;
            }
            inner.state = SessionState::Expired;
            inner.channel = None;
            inner.log.clear();
        }

        self.registry.release_all();
        tracing::info!(session_id = %self.id, "session expired");
    }

    /// A peer whose messages are pushed through this session.
    pub fn peer(self: &Arc<Self>) -> Peer {
        Peer::new(self.clone(), self.registry.clone())
    }

    /// The dispatcher context for messages arriving on this session.
    pub fn channel_context(self: &Arc<Self>, credentials: Option<String>) -> ChannelContext {
        ChannelContext::new(self.peer())
            .with_session_id(self.id.as_str())
            .with_credentials(credentials)
    }
}

#[async_trait]
impl MessageSink for Session {
    async fn send(&self, message: Message) -> std::result::Result<(), RpcError> {
        match self.push(&message) {
            Ok(_) => Ok(()),
            Err(e) if e.is_gone() => Err(RpcError::ChannelClosed),
            Err(e) => Err(RpcError::send(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventLogConfig;
    use serde_json::json;
    use tether_protocol::JsonRpcNotification;
    use tokio_util::sync::CancellationToken;

    fn session(config: SessionConfig) -> Arc<Session> {
        Arc::new(Session::new(SessionId::generate(), &config))
    }

    fn note(n: u64) -> Message {
        Message::Notification(JsonRpcNotification::new(
            "notifications/message",
            Some(json!({"n": n})),
        ))
    }

    async fn event_ids(stream: &mut PushStream, count: usize) -> Vec<EventId> {
        let mut ids = Vec::new();
        for _ in 0..count {
            match stream.recv().await {
                Some(PushFrame::Event(record)) => ids.push(record.id),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        ids
    }

    #[test]
    fn test_session_id_format() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), 43);
        assert!(id.as_str().bytes().all(|b| (0x21..=0x7e).contains(&b)));
        assert_ne!(id, SessionId::generate());

        assert!(SessionId::parse("abc-123").is_ok());
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("has space").is_err());
        assert!(SessionId::parse("tab\t").is_err());
    }

    #[test]
    fn test_lifecycle_states() {
        let session = session(SessionConfig::default());
        assert_eq!(session.state(), SessionState::Created);
        session.activate();
        assert_eq!(session.state(), SessionState::Active);
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.push(&note(1)),
            Err(SessionError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_push_without_stream_waits_in_log() {
        let session = session(SessionConfig::default());
        session.push(&note(1)).unwrap();
        session.push(&note(2)).unwrap();

        let mut stream = session.attach(None).unwrap();
        assert_eq!(event_ids(&mut stream, 2).await, vec![1, 2]);

        session.push(&note(3)).unwrap();
        assert_eq!(event_ids(&mut stream, 1).await, vec![3]);
    }

    #[tokio::test]
    async fn test_resume_with_last_event_id() {
        let session = session(SessionConfig::default());
        let mut first = session.attach(None).unwrap();
        for n in 1..=4 {
            session.push(&note(n)).unwrap();
        }
        assert_eq!(event_ids(&mut first, 2).await, vec![1, 2]);
        drop(first);

        let mut resumed = session.attach(Some(2)).unwrap();
        assert_eq!(event_ids(&mut resumed, 2).await, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_resume_gap() {
        let config = SessionConfig::default()
            .with_event_log(EventLogConfig::default().with_capacity(2).without_max_age());
        let session = session(config);
        for n in 1..=5 {
            session.push(&note(n)).unwrap();
        }
        assert!(matches!(
            session.attach(Some(1)),
            Err(SessionError::ReplayGap {
                requested: 1,
                floor: 3
            })
        ));
        assert!(session.attach(Some(3)).is_ok());
    }

    #[tokio::test]
    async fn test_new_attach_replaces_old_stream() {
        let session = session(SessionConfig::default());
        let mut old = session.attach(None).unwrap();
        let mut new = session.attach(Some(0)).unwrap();

        assert!(old.recv().await.is_none());
        drop(old);
        // Dropping the replaced stream must not detach the new one.
        assert!(session.is_attached());

        session.push(&note(1)).unwrap();
        assert_eq!(event_ids(&mut new, 1).await, vec![1]);
    }

    #[tokio::test]
    async fn test_dropping_stream_detaches() {
        let session = session(SessionConfig::default());
        let stream = session.attach(None).unwrap();
        assert!(session.is_attached());
        drop(stream);
        assert!(!session.is_attached());
    }

    #[tokio::test]
    async fn test_stalled_stream_is_detached() {
        let session = session(SessionConfig::default().with_push_buffer(2));
        let mut stream = session.attach(None).unwrap();
        for n in 1..=3 {
            session.push(&note(n)).unwrap();
        }
        assert!(!session.is_attached());

        // Buffered frames drain, then the stream ends.
        assert_eq!(event_ids(&mut stream, 2).await, vec![1, 2]);
        assert!(stream.recv().await.is_none());
        drop(stream);

        // The undelivered event is replayed on the next attach.
        let mut next = session.attach(None).unwrap();
        assert_eq!(event_ids(&mut next, 1).await, vec![3]);
    }

    #[tokio::test]
    async fn test_close_flushes_queued_frames_and_releases_registry() {
        let session = session(SessionConfig::default());
        let token = CancellationToken::new();
        session
            .registry()
            .register(tether_protocol::RequestId::Number(1), token.clone())
            .unwrap();
        let mut stream = session.attach(None).unwrap();
        session.push(&note(1)).unwrap();

        session.close();

        assert!(token.is_cancelled());
        assert_eq!(event_ids(&mut stream, 1).await, vec![1]);
        assert!(stream.recv().await.is_none());
        assert!(session.attach(None).is_err());
    }

    #[tokio::test]
    async fn test_peer_pushes_through_session() {
        let session = session(SessionConfig::default());
        let mut stream = session.attach(None).unwrap();

        session
            .peer()
            .notify("notifications/message", Some(json!({"level": "info", "data": 1})))
            .await
            .unwrap();

        let Some(PushFrame::Event(record)) = stream.recv().await else {
            panic!("expected event");
        };
        let message = Message::parse(record.payload.as_bytes()).unwrap();
        assert_eq!(message.method(), Some("notifications/message"));

        session.expire();
        assert!(matches!(
            session.peer().notify("x", None).await,
            Err(RpcError::ChannelClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_tracking() {
        let session = session(SessionConfig::default());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(session.is_idle(Duration::from_secs(10)));
        session.touch();
        assert!(!session.is_idle(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_push_counts_as_activity() {
        let session = session(SessionConfig::default());
        let mut stream = session.attach(None).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        session.push(&note(1)).unwrap();
        assert_eq!(event_ids(&mut stream, 1).await, vec![1]);
        assert!(!session.is_idle(Duration::from_secs(10)));

        // Logging with nobody attached is not activity.
        drop(stream);
        tokio::time::advance(Duration::from_secs(10)).await;
        session.push(&note(2)).unwrap();
        assert!(session.is_idle(Duration::from_secs(10)));
    }
}

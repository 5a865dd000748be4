//! Streamable HTTP channel: one POST per outbound envelope, a long-lived
//! event stream (GET) for everything the server pushes.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use tether_protocol::{EventId, SseCodec, SseFrame, headers};
use tokio::sync::{Notify, mpsc};
use tokio::task::AbortHandle;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::channel::{DuplexChannel, Inbound, InboundItem};
use crate::error::{ChannelError, Result};

/// Default time to wait for the server to accept a POST or open the
/// event stream.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time without any bytes on the event stream before it is
/// considered dropped. Three server keepalive intervals.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Configuration for an [`HttpChannel`].
#[derive(Debug, Clone)]
pub struct HttpChannelConfig {
    /// Endpoint URL, e.g. `http://localhost:8080/mcp`.
    pub url: String,
    /// Time to wait for response headers. Requests are answered on an
    /// event stream whose headers arrive before the handler finishes.
    pub timeout: Duration,
    /// Idle limit on the event stream. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
    /// Bearer token sent in `Authorization`.
    pub bearer_token: Option<String>,
    /// Session to resume instead of starting a new one.
    pub session_id: Option<String>,
    /// Last event id seen on the resumed session.
    pub last_event_id: Option<EventId>,
}

impl Default for HttpChannelConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: DEFAULT_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            headers: Vec::new(),
            bearer_token: None,
            session_id: None,
            last_event_id: None,
        }
    }
}

impl HttpChannelConfig {
    /// Create a config for an endpoint URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the response timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the event stream idle limit.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Authenticate with a bearer token.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Resume an existing session.
    pub fn with_session(
        mut self,
        session_id: impl Into<String>,
        last_event_id: Option<EventId>,
    ) -> Self {
        self.session_id = Some(session_id.into());
        self.last_event_id = last_event_id;
        self
    }
}

#[derive(Debug, Default)]
enum StreamState {
    /// Not opened yet, or re-armed for a reconnect.
    #[default]
    Idle,
    /// A reader task is pumping the stream opened as `generation`.
    Running {
        task: AbortHandle,
        generation: u64,
    },
    /// Dropped; waits for an explicit reconnect.
    Lost,
    /// The server answered 405: it never pushes outside POST responses.
    Unsupported,
}

/// State shared with the stream reader tasks.
#[derive(Debug, Default)]
struct Shared {
    session_id: Mutex<Option<String>>,
    last_event_id: Mutex<Option<EventId>>,
    stream: Mutex<StreamState>,
    generation: AtomicU64,
    session_known: Notify,
}

impl Shared {
    fn capture_session_id(&self, response: &reqwest::Response) {
        let Some(assigned) = response
            .headers()
            .get(headers::SESSION_ID)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };

        {
            let mut current = self.session_id.lock();
            if current.as_deref() == Some(assigned) {
                return;
            }
            tracing::debug!(session_id = %assigned, "session established");
            *current = Some(assigned.to_string());
        }

        // A new session starts its event numbering from scratch.
        *self.last_event_id.lock() = None;
        if let StreamState::Running { task, .. } = std::mem::take(&mut *self.stream.lock()) {
            task.abort();
        }
        self.session_known.notify_one();
    }
}

enum BodyKind {
    Json,
    EventStream,
    Empty,
}

impl BodyKind {
    fn of(response: &reqwest::Response) -> Self {
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if content_type.starts_with("text/event-stream") {
            BodyKind::EventStream
        } else if content_type.starts_with("application/json") {
            BodyKind::Json
        } else {
            BodyKind::Empty
        }
    }
}

/// Duplex channel over POST and an event stream.
///
/// The event stream is opened lazily by the first `read` after the server
/// assigned a session id, and reopened with `Last-Event-ID` by
/// [`reconnect`](DuplexChannel::reconnect).
pub struct HttpChannel {
    http: reqwest::Client,
    config: HttpChannelConfig,
    shared: Arc<Shared>,
    inbound_tx: mpsc::UnboundedSender<InboundItem>,
    inbound: tokio::sync::Mutex<Inbound>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for HttpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChannel")
            .field("url", &self.config.url)
            .field("session_id", &self.session_id())
            .field("last_event_id", &self.last_event_id())
            .finish_non_exhaustive()
    }
}

impl HttpChannel {
    /// Create a channel. No request is sent until the first write or read.
    pub fn connect(config: HttpChannelConfig) -> Result<Self> {
        url::Url::parse(&config.url).map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;

        // No client-wide timeout: it would also cap the event stream body.
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(5)
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        let shared = Shared {
            session_id: Mutex::new(config.session_id.clone()),
            last_event_id: Mutex::new(config.last_event_id),
            stream: Mutex::new(StreamState::Idle),
            generation: AtomicU64::new(0),
            session_known: Notify::new(),
        };
        let (inbound_tx, rx) = mpsc::unbounded_channel();

        tracing::info!(
            url = %config.url,
            timeout_secs = config.timeout.as_secs(),
            resuming = config.session_id.is_some(),
            "created HTTP channel"
        );

        Ok(Self {
            http,
            config,
            shared: Arc::new(shared),
            inbound_tx,
            inbound: tokio::sync::Mutex::new(Inbound::new(rx)),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// The session id assigned by the server, once known.
    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id.lock().clone()
    }

    /// The id of the last event received on the event stream.
    pub fn last_event_id(&self) -> Option<EventId> {
        *self.shared.last_event_id.lock()
    }

    fn request(&self, method: Method) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, &self.config.url);
        for (key, value) in &self.config.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(token) = &self.config.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(session_id) = self.session_id() {
            builder = builder.header(headers::SESSION_ID, session_id);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        match tokio::time::timeout(self.config.timeout, builder.send()).await {
            Ok(response) => Ok(response?),
            Err(_) => Err(ChannelError::Timeout),
        }
    }

    fn should_open_stream(&self) -> bool {
        matches!(*self.shared.stream.lock(), StreamState::Idle) && self.session_id().is_some()
    }

    /// Open the event stream, resuming after the last seen event id.
    async fn open_event_stream(&self) -> Result<()> {
        let last_event_id = self.last_event_id();
        let mut builder = self.request(Method::GET).header(ACCEPT, "text/event-stream");
        if let Some(id) = last_event_id {
            builder = builder.header(headers::LAST_EVENT_ID, id.to_string());
        }

        let response = self.send(builder).await?;
        let status = response.status();

        if status == StatusCode::METHOD_NOT_ALLOWED {
            tracing::debug!("server offers no event stream");
            *self.shared.stream.lock() = StreamState::Unsupported;
            return Ok(());
        }
        if !status.is_success() {
            *self.shared.stream.lock() = StreamState::Lost;
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "event stream rejected");
            return Err(ChannelError::from_stream_status(status.as_u16(), body));
        }

        tracing::debug!(?last_event_id, "event stream opened");

        let shared = Arc::clone(&self.shared);
        let tx = self.inbound_tx.clone();
        let idle_timeout = self.config.idle_timeout;

        // Hold the state lock across the spawn so a stream that ends at once
        // cannot be marked lost before it is marked running.
        let mut stream = self.shared.stream.lock();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let task = tokio::spawn(async move {
            let reason = match pump_events(response, &shared, &tx, idle_timeout).await {
                PumpEnd::Lost(reason) => reason,
                PumpEnd::Finished => "event stream ended".to_string(),
            };

            // A stream replaced by a newer one ends quietly.
            {
                let mut state = shared.stream.lock();
                if !matches!(*state, StreamState::Running { generation: current, .. } if current == generation)
                {
                    tracing::debug!(generation, "superseded event stream ended");
                    return;
                }
                *state = StreamState::Lost;
            }
            tracing::warn!(reason = %reason, "event stream lost");
            let _ = tx.send(InboundItem::Lost(reason));
        });
        let running = StreamState::Running {
            task: task.abort_handle(),
            generation,
        };
        if let StreamState::Running { task: previous, .. } = std::mem::replace(&mut *stream, running)
        {
            previous.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl DuplexChannel for HttpChannel {
    /// POST one envelope. A non-2xx status is returned as
    /// [`ChannelError::Write`]; the response body, JSON or event stream,
    /// is delivered through `read`.
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Closed);
        }

        let body = buf.trim_ascii_end();
        let builder = self
            .request(Method::POST)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body.to_vec());

        let response = self.send(builder).await?;
        deliver(response, &self.shared, &self.inbound_tx).await?;
        Ok(buf.len())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inbound = self.inbound.lock().await;
        loop {
            if let Some(n) = inbound.drain_into(buf) {
                return Ok(n);
            }
            if self.cancel.is_cancelled() {
                return Ok(0);
            }
            if self.should_open_stream() {
                self.open_event_stream().await?;
                continue;
            }

            let item = tokio::select! {
                item = inbound.rx.recv() => item,
                _ = self.shared.session_known.notified() => continue,
                _ = self.cancel.cancelled() => return Ok(0),
            };
            match item {
                Some(InboundItem::Data(bytes)) => inbound.buffer(&bytes),
                Some(InboundItem::Lost(reason)) => {
                    return Err(ChannelError::ConnectionLost(reason));
                }
                None => return Ok(0),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        if let StreamState::Running { task, .. } = std::mem::take(&mut *self.shared.stream.lock())
        {
            task.abort();
        }

        if let Some(session_id) = self.session_id() {
            match self.send(self.request(Method::DELETE)).await {
                Ok(response) => {
                    tracing::debug!(%session_id, status = response.status().as_u16(), "session released");
                }
                Err(e) => {
                    tracing::debug!(%session_id, error = %e, "failed to release session");
                }
            }
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        if self.session_id().is_none() {
            return Err(ChannelError::SessionNotFound);
        }
        tracing::info!(last_event_id = ?self.last_event_id(), "resuming event stream");
        self.open_event_stream().await
    }
}

/// Handle a POST response: record the session id and queue the body.
async fn deliver(
    response: reqwest::Response,
    shared: &Arc<Shared>,
    tx: &mpsc::UnboundedSender<InboundItem>,
) -> Result<()> {
    shared.capture_session_id(&response);

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), "POST rejected");
        return Err(ChannelError::Write {
            status: status.as_u16(),
            body,
        });
    }

    match BodyKind::of(&response) {
        BodyKind::Json => {
            let body = response.bytes().await?;
            let body = body.trim_ascii();
            if !body.is_empty() {
                let _ = tx.send(InboundItem::line(body));
            }
        }
        BodyKind::EventStream => {
            let shared = Arc::clone(shared);
            let tx = tx.clone();
            tokio::spawn(async move {
                if let PumpEnd::Lost(reason) = pump_events(response, &shared, &tx, None).await {
                    tracing::warn!(reason = %reason, "response stream dropped");
                }
            });
        }
        BodyKind::Empty => {}
    }
    Ok(())
}

enum PumpEnd {
    Finished,
    Lost(String),
}

/// Decode an event-stream body into the inbound queue.
async fn pump_events(
    response: reqwest::Response,
    shared: &Shared,
    tx: &mpsc::UnboundedSender<InboundItem>,
    idle_timeout: Option<Duration>,
) -> PumpEnd {
    let body = StreamReader::new(response.bytes_stream().map_err(io::Error::other));
    let mut frames = FramedRead::new(body, SseCodec::new());

    loop {
        let next = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, frames.next()).await {
                Ok(next) => next,
                Err(_) => return PumpEnd::Lost("idle timeout".to_string()),
            },
            None => frames.next().await,
        };

        match next {
            Some(Ok(SseFrame::Event(event))) => {
                if let Some(id) = event.id {
                    *shared.last_event_id.lock() = Some(id);
                }
                if tx.send(InboundItem::line(event.data.as_bytes())).is_err() {
                    return PumpEnd::Finished;
                }
            }
            Some(Ok(SseFrame::Comment(_))) => {}
            Some(Ok(SseFrame::Malformed(reason))) => {
                tracing::warn!(reason = %reason, "skipping malformed frame");
            }
            Some(Err(e)) => return PumpEnd::Lost(e.to_string()),
            None => return PumpEnd::Finished,
        }
    }
}

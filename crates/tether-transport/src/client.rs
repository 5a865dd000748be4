//! Client connection over a duplex channel.
//!
//! The [`Client`] owns a reader task that splits the channel's byte stream
//! into envelopes and hands them to a [`Dispatcher`]: responses resolve the
//! caller waiting on them, progress notifications reach the subscriber of
//! their token, and server-initiated requests run on the client's handler.
//!
//! A dropped stream is resumed with exponential backoff. When the channel
//! cannot be resumed every outstanding call fails with
//! [`RpcError::ChannelClosed`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use serde_json::Value;
use tether_protocol::{
    ClientCapabilities, Implementation, InitializeParams, InitializeResult, JsonRpcRequest,
    MCP_PROTOCOL_VERSION, Message, ProgressParams, RequestId, methods,
};
use tether_rpc::{
    ChannelContext, DEFAULT_REQUEST_TIMEOUT, Dispatcher, Handler, MessageSink, Peer,
    RequestRegistry, ResponseWaiter, Router, RpcError,
};
use tokio::task::JoinHandle;

use crate::channel::DuplexChannel;
use crate::error::ChannelError;

/// Default number of reconnect attempts after a dropped stream.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(100);

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const READ_CHUNK: usize = 8 * 1024;

/// Configuration for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Time to wait for a response.
    pub request_timeout: Duration,
    /// Reconnect attempts before giving up on a dropped stream.
    pub reconnect_attempts: u32,
    /// Delay before the first reconnect; doubles on every attempt.
    pub reconnect_delay: Duration,
    /// Identity sent during the handshake.
    pub client_info: Implementation,
    /// Capabilities sent during the handshake.
    pub capabilities: ClientCapabilities,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            client_info: Implementation::default(),
            capabilities: ClientCapabilities::default(),
        }
    }
}

impl ClientConfig {
    /// Set the response timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the number of reconnect attempts. Zero disables reconnecting.
    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    /// Set the initial reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the client identity.
    pub fn with_client_info(mut self, info: Implementation) -> Self {
        self.client_info = info;
        self
    }

    /// Set the client capabilities.
    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Writes outbound messages to the channel.
struct ChannelSink(Arc<dyn DuplexChannel>);

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&self, message: Message) -> tether_rpc::Result<()> {
        let json = message.to_json()?;
        match self.0.write(json.as_bytes()).await {
            Ok(_) => Ok(()),
            Err(ChannelError::Closed) => Err(RpcError::ChannelClosed),
            Err(e) => Err(RpcError::send(e.to_string())),
        }
    }
}

/// A request that was sent and is awaiting its response.
#[derive(Debug)]
pub struct PendingCall {
    waiter: ResponseWaiter,
    timeout: Duration,
    peer: Peer,
}

impl PendingCall {
    /// The request id, for [`Client::cancel`].
    pub fn id(&self) -> &RequestId {
        self.waiter.id()
    }

    /// Wait for the result.
    ///
    /// A call cancelled through [`Client::cancel`] fails with
    /// [`RpcError::ChannelClosed`].
    pub async fn response(self) -> tether_rpc::Result<Value> {
        let id = self.waiter.id().clone();
        match tokio::time::timeout(self.timeout, self.waiter.recv()).await {
            Ok(response) => response?.into_result().map_err(RpcError::Remote),
            Err(_) => {
                self.peer.registry().abandon(&id);
                let _ = self.peer.cancel(&id, Some("timeout")).await;
                Err(RpcError::Timeout)
            }
        }
    }
}

/// A connection to a server over any [`DuplexChannel`].
pub struct Client {
    channel: Arc<dyn DuplexChannel>,
    peer: Peer,
    config: ClientConfig,
    reader: JoinHandle<()>,
    server: Mutex<Option<InitializeResult>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Start a client that answers server-initiated requests with the
    /// default router (`ping` only).
    pub fn new(channel: Arc<dyn DuplexChannel>, config: ClientConfig) -> Self {
        Self::with_handler(channel, Router::new(), config)
    }

    /// Start a client with a handler for server-initiated requests.
    pub fn with_handler(
        channel: Arc<dyn DuplexChannel>,
        handler: impl Handler + 'static,
        config: ClientConfig,
    ) -> Self {
        let registry = Arc::new(RequestRegistry::new());
        let peer = Peer::new(Arc::new(ChannelSink(Arc::clone(&channel))), registry)
            .with_timeout(config.request_timeout);
        let context = ChannelContext::new(peer.clone());
        let reader = tokio::spawn(read_loop(
            Arc::clone(&channel),
            Dispatcher::new(handler),
            context,
            config.clone(),
        ));

        Self {
            channel,
            peer,
            config,
            reader,
            server: Mutex::new(None),
        }
    }

    /// Handle for sending requests and notifications.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// What the server reported during the handshake.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.server.lock().clone()
    }

    /// Check whether the reader is still running.
    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished()
    }

    /// Perform the `initialize` handshake.
    pub async fn initialize(&self) -> tether_rpc::Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: self.config.capabilities.clone(),
            client_info: self.config.client_info.clone(),
        };
        let value = self
            .peer
            .request(methods::INITIALIZE, Some(serde_json::to_value(params)?))
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;
        self.peer.notify(methods::INITIALIZED, None).await?;

        tracing::info!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            protocol_version = %result.protocol_version,
            "connected to server"
        );
        *self.server.lock() = Some(result.clone());
        Ok(result)
    }

    /// Send a request and wait for its result.
    pub async fn request(&self, method: &str, params: Option<Value>) -> tether_rpc::Result<Value> {
        self.peer.request(method, params).await
    }

    /// Send a request without waiting, so it can be cancelled.
    pub async fn start(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> tether_rpc::Result<PendingCall> {
        let request =
            JsonRpcRequest::new(self.peer.registry().next_request_id(), method, params);
        let waiter = self.peer.start_request(request).await?;
        Ok(PendingCall {
            waiter,
            timeout: self.config.request_timeout,
            peer: self.peer.clone(),
        })
    }

    /// Send a request asking for progress, calling `on_progress` for every
    /// accepted update.
    ///
    /// Each update restarts the response timeout.
    pub async fn request_with_progress<F>(
        &self,
        method: &str,
        params: Option<Value>,
        mut on_progress: F,
    ) -> tether_rpc::Result<Value>
    where
        F: FnMut(ProgressParams) + Send,
    {
        let registry = self.peer.registry();
        let id = registry.next_request_id();
        let token = id.clone();
        let mut progress = registry.subscribe_progress(token.clone());

        let request =
            JsonRpcRequest::new(id.clone(), method, params).with_progress_token(token.clone());
        let waiter = match self.peer.start_request(request).await {
            Ok(waiter) => waiter,
            Err(e) => {
                registry.clear_progress(&token);
                return Err(e);
            }
        };

        let timeout = self.config.request_timeout;
        let response = waiter.recv();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(response, deadline);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(update) = progress.recv() => {
                    deadline.as_mut().reset(tokio::time::Instant::now() + timeout);
                    on_progress(update);
                }
                received = &mut response => break received,
                _ = &mut deadline => {
                    registry.abandon(&id);
                    tracing::warn!(request_id = %id, "request timed out");
                    let _ = self.peer.cancel(&id, Some("timeout")).await;
                    break Err(RpcError::Timeout);
                }
            }
        };
        registry.clear_progress(&token);
        outcome?.into_result().map_err(RpcError::Remote)
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> tether_rpc::Result<()> {
        self.peer.notify(method, params).await
    }

    /// Stop waiting for a call and ask the server to cancel it.
    pub async fn cancel(&self, id: &RequestId, reason: Option<&str>) -> tether_rpc::Result<()> {
        self.peer.registry().abandon(id);
        self.peer.cancel(id, reason).await
    }

    /// Close the channel. Outstanding calls fail with
    /// [`RpcError::ChannelClosed`].
    pub async fn close(&self) -> crate::Result<()> {
        let result = self.channel.close().await;
        self.peer.registry().release_all();
        result
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    channel: Arc<dyn DuplexChannel>,
    dispatcher: Dispatcher,
    context: ChannelContext,
    config: ClientConfig,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut lines = BytesMut::new();

    loop {
        match channel.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("channel closed");
                break;
            }
            Ok(n) => {
                lines.extend_from_slice(&buf[..n]);
                while let Some(pos) = lines.iter().position(|b| *b == b'\n') {
                    let line = lines.split_to(pos + 1);
                    let raw = line[..pos].trim_ascii();
                    if !raw.is_empty() {
                        handle_line(raw, &dispatcher, &context).await;
                    }
                }
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "connection lost, reconnecting");
                lines.clear();
                if let Err(e) = reconnect(channel.as_ref(), &config).await {
                    tracing::error!(error = %e, "giving up on connection");
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "channel failed");
                break;
            }
        }
    }

    context.registry.release_all();
}

async fn handle_line(raw: &[u8], dispatcher: &Dispatcher, context: &ChannelContext) {
    let message = match Message::parse(raw) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed message");
            return;
        }
    };

    match message {
        Message::Request(request) => {
            // Server-initiated requests must not stall the reader.
            let dispatcher = dispatcher.clone();
            let context = context.clone();
            tokio::spawn(async move {
                let Some(response) = dispatcher
                    .dispatch(Message::Request(request), &context)
                    .await
                else {
                    return;
                };
                if let Err(e) = context.peer.send(response.into()).await {
                    tracing::debug!(error = %e, "failed to send response");
                }
            });
        }
        other => {
            dispatcher.dispatch(other, context).await;
        }
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_RECONNECT_DELAY)
}

async fn reconnect(channel: &dyn DuplexChannel, config: &ClientConfig) -> crate::Result<()> {
    let mut last_error = ChannelError::connection_lost("reconnect disabled");

    for attempt in 0..config.reconnect_attempts {
        tokio::time::sleep(backoff(config.reconnect_delay, attempt)).await;
        match channel.reconnect().await {
            Ok(()) => {
                tracing::info!(attempt, "reconnected");
                return Ok(());
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(attempt, error = %e, "reconnect failed");
                last_error = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Inbound, InboundItem};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tether_protocol::ProgressToken;
    use tokio::sync::{mpsc, oneshot};
    use tokio_util::sync::CancellationToken;

    /// One end of an in-memory channel pair.
    struct MemoryChannel {
        peer_tx: mpsc::UnboundedSender<InboundItem>,
        own_tx: mpsc::UnboundedSender<InboundItem>,
        inbound: tokio::sync::Mutex<Inbound>,
        closed: CancellationToken,
        reconnects: AtomicU32,
        resumable: bool,
    }

    impl MemoryChannel {
        fn pair(resumable: bool) -> (Arc<Self>, Arc<Self>) {
            let (a_tx, a_rx) = mpsc::unbounded_channel();
            let (b_tx, b_rx) = mpsc::unbounded_channel();
            let end = |peer_tx, own_tx, rx| {
                Arc::new(Self {
                    peer_tx,
                    own_tx,
                    inbound: tokio::sync::Mutex::new(Inbound::new(rx)),
                    closed: CancellationToken::new(),
                    reconnects: AtomicU32::new(0),
                    resumable,
                })
            };
            (
                end(b_tx.clone(), a_tx.clone(), a_rx),
                end(a_tx, b_tx, b_rx),
            )
        }

        fn drop_stream(&self) {
            let _ = self.own_tx.send(InboundItem::Lost("test".into()));
        }
    }

    #[async_trait]
    impl DuplexChannel for MemoryChannel {
        async fn write(&self, buf: &[u8]) -> crate::Result<usize> {
            if self.closed.is_cancelled() {
                return Err(ChannelError::Closed);
            }
            self.peer_tx
                .send(InboundItem::line(buf.trim_ascii_end()))
                .map_err(|_| ChannelError::Closed)?;
            Ok(buf.len())
        }

        async fn read(&self, buf: &mut [u8]) -> crate::Result<usize> {
            let mut inbound = self.inbound.lock().await;
            loop {
                if let Some(n) = inbound.drain_into(buf) {
                    return Ok(n);
                }
                let item = tokio::select! {
                    item = inbound.rx.recv() => item,
                    _ = self.closed.cancelled() => return Ok(0),
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

        async fn close(&self) -> crate::Result<()> {
            self.closed.cancel();
            Ok(())
        }

        async fn reconnect(&self) -> crate::Result<()> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            if self.resumable {
                Ok(())
            } else {
                Err(ChannelError::SessionNotFound)
            }
        }
    }

    fn config() -> ClientConfig {
        ClientConfig::default()
            .with_request_timeout(Duration::from_secs(5))
            .with_reconnect_delay(Duration::from_millis(1))
    }

    /// A client on one end and a "server" on the other, both built from
    /// the same connection type.
    fn connect(server: Router, resumable: bool) -> (Client, Client, Arc<MemoryChannel>) {
        let (client_end, server_end) = MemoryChannel::pair(resumable);
        let client = Client::new(client_end.clone(), config());
        let server = Client::with_handler(server_end, server, config());
        (client, server, client_end)
    }

    #[test]
    fn test_backoff_is_capped() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 0), Duration::from_millis(100));
        assert_eq!(backoff(base, 3), Duration::from_millis(800));
        assert_eq!(backoff(base, 20), MAX_RECONNECT_DELAY);
        assert_eq!(backoff(base, 40), MAX_RECONNECT_DELAY);
    }

    #[tokio::test]
    async fn test_initialize_handshake() {
        let (initialized_tx, mut initialized_rx) = mpsc::unbounded_channel();
        let router = Router::new()
            .with_server_info(Implementation::new("test-server", "1.2.3"))
            .on_notification(methods::INITIALIZED, move |_channel, _params| {
                let tx = initialized_tx.clone();
                async move {
                    let _ = tx.send(());
                }
            });
        let (client, _server, _) = connect(router, true);

        let result = client.initialize().await.unwrap();
        assert_eq!(result.server_info.name, "test-server");
        assert_eq!(result.protocol_version, MCP_PROTOCOL_VERSION);
        assert_eq!(client.server_info(), Some(result));
        initialized_rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_errors_surface() {
        let (client, _server, _) = connect(Router::new(), true);
        let err = client.request("tools/missing", None).await.unwrap_err();
        match err {
            RpcError::Remote(e) => {
                assert_eq!(e.code, tether_protocol::JsonRpcError::METHOD_NOT_FOUND)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_progress_reaches_caller_in_order() {
        let router = Router::new().method("work", |ctx, _params| async move {
            for value in [10.0, 25.0, 25.0, 40.0] {
                // The repeated value is refused before it is sent.
                let _ = ctx.report_progress(value, Some(40.0), None).await;
            }
            Ok(json!({"done": true}))
        });
        let (client, _server, _) = connect(router, true);

        let mut seen = Vec::new();
        let result = client
            .request_with_progress("work", Some(json!({})), |update| {
                seen.push(update.progress)
            })
            .await
            .unwrap();

        assert_eq!(result, json!({"done": true}));
        assert_eq!(seen, vec![10.0, 25.0, 40.0]);
        assert_eq!(
            client.peer().registry().last_progress(&ProgressToken::from(1)),
            None
        );
    }

    #[tokio::test]
    async fn test_cancel_reaches_handler() {
        let (cancelled_tx, cancelled_rx) = oneshot::channel();
        let cancelled_tx = Arc::new(Mutex::new(Some(cancelled_tx)));
        let router = Router::new().method("slow", move |ctx, _params| {
            let cancelled_tx = Arc::clone(&cancelled_tx);
            async move {
                ctx.cancelled().await;
                if let Some(tx) = cancelled_tx.lock().take() {
                    let _ = tx.send(());
                }
                Ok(Value::Null)
            }
        });
        let (client, server, _) = connect(router, true);

        let call = client.start("slow", None).await.unwrap();
        let id = call.id().clone();
        // Wait until the server has registered the request.
        while !server.peer().registry().is_pending(&id) {
            tokio::task::yield_now().await;
        }

        client.cancel(&id, Some("user")).await.unwrap();
        cancelled_rx.await.unwrap();
        assert!(matches!(
            call.response().await,
            Err(RpcError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_server_initiated_request() {
        let (client_end, server_end) = MemoryChannel::pair(true);
        let client_router = Router::new().method("roots/list", |_ctx, _params| async move {
            Ok(json!({"roots": [{"uri": "file:///work"}]}))
        });
        let _client = Client::with_handler(client_end, client_router, config());
        let server = Client::new(server_end, config());

        let roots = server.request("roots/list", None).await.unwrap();
        assert_eq!(roots["roots"][0]["uri"], "file:///work");
    }

    #[tokio::test]
    async fn test_resumes_after_dropped_stream() {
        let router = Router::new().method("echo", |_ctx, params| async move {
            Ok(params.unwrap_or(Value::Null))
        });
        let (client, _server, client_end) = connect(router, true);

        client_end.drop_stream();
        let value = client.request("echo", Some(json!("after"))).await.unwrap();

        assert_eq!(value, json!("after"));
        assert_eq!(client_end.reconnects.load(Ordering::SeqCst), 1);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_failed_resume_closes_outstanding_calls() {
        let router = Router::new().method("never", |ctx, _params| async move {
            ctx.cancelled().await;
            Ok(Value::Null)
        });
        let (client, _server, client_end) = connect(router, false);

        let call = client.start("never", None).await.unwrap();
        client_end.drop_stream();

        assert!(matches!(
            call.response().await,
            Err(RpcError::ChannelClosed)
        ));
        assert_eq!(client_end.reconnects.load(Ordering::SeqCst), 1);
        assert!(matches!(
            client.request("never", None).await,
            Err(RpcError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_calls() {
        let router = Router::new().method("never", |ctx, _params| async move {
            ctx.cancelled().await;
            Ok(Value::Null)
        });
        let (client, _server, _) = connect(router, true);

        let call = client.start("never", None).await.unwrap();
        client.close().await.unwrap();

        assert!(matches!(
            call.response().await,
            Err(RpcError::ChannelClosed)
        ));
    }
}

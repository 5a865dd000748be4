//! WebSocket channel: one JSON envelope per text frame.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tether_protocol::{EventId, headers};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::channel::{DuplexChannel, Inbound, InboundItem};
use crate::error::{ChannelError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for a [`WsChannel`].
#[derive(Debug, Clone, Default)]
pub struct WsChannelConfig {
    /// Endpoint URL. An `http(s)` endpoint is mapped to its `/ws` path.
    pub url: String,
    /// Extra headers sent with the upgrade request.
    pub headers: Vec<(String, String)>,
    /// Bearer token sent in `Authorization`.
    pub bearer_token: Option<String>,
    /// Existing session whose push path to take over.
    pub session_id: Option<String>,
    /// Last event id seen on that session.
    pub last_event_id: Option<EventId>,
}

impl WsChannelConfig {
    /// Create a config for an endpoint URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
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

    /// Attach to an existing session.
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

/// Map an endpoint URL to its WebSocket URL.
///
/// `http://host/mcp` becomes `ws://host/mcp/ws`; `ws(s)` URLs are used as is.
pub fn ws_url(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint).map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ChannelError::InvalidUrl(format!(
                "unsupported scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChannelError::InvalidUrl("failed to set scheme".to_string()))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| ChannelError::websocket(format!("invalid header value: {e}")))
}

fn connect_error(error: tungstenite::Error) -> ChannelError {
    match error {
        tungstenite::Error::Http(response) => {
            let body = response
                .body()
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            ChannelError::from_stream_status(response.status().as_u16(), body)
        }
        other => ChannelError::websocket(other.to_string()),
    }
}

/// Duplex channel over a WebSocket.
///
/// Cannot resume: a dropped connection is final for this channel.
pub struct WsChannel {
    sink: tokio::sync::Mutex<SplitSink<WsStream, WsMessage>>,
    inbound: tokio::sync::Mutex<Inbound>,
    reader: AbortHandle,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for WsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsChannel")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl WsChannel {
    /// Connect and start reading frames.
    pub async fn connect(config: WsChannelConfig) -> Result<Self> {
        let url = ws_url(&config.url)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::websocket(e.to_string()))?;

        let request_headers = request.headers_mut();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| ChannelError::websocket(format!("invalid header name: {e}")))?;
            request_headers.insert(name, header_value(value)?);
        }
        if let Some(token) = &config.bearer_token {
            request_headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
        }
        if let Some(session_id) = &config.session_id {
            request_headers.insert(
                HeaderName::from_static(headers::SESSION_ID),
                header_value(session_id)?,
            );
        }
        if let Some(last_event_id) = config.last_event_id {
            request_headers.insert(
                HeaderName::from_static(headers::LAST_EVENT_ID),
                header_value(&last_event_id.to_string())?,
            );
        }

        let (stream, _response) = connect_async(request).await.map_err(connect_error)?;
        tracing::info!(url = %url, "connected WebSocket channel");

        let (sink, stream) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(pump_frames(stream, tx)).abort_handle();

        Ok(Self {
            sink: tokio::sync::Mutex::new(sink),
            inbound: tokio::sync::Mutex::new(Inbound::new(rx)),
            reader,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }
}

async fn pump_frames(mut stream: SplitStream<WsStream>, tx: mpsc::UnboundedSender<InboundItem>) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                if tx.send(InboundItem::line(text.as_str().as_bytes())).is_err() {
                    return;
                }
            }
            Some(Ok(WsMessage::Binary(_))) => {
                tracing::warn!("ignoring binary frame");
            }
            Some(Ok(WsMessage::Close(_))) => break "closed by server".to_string(),
            // Ping/pong are answered by tungstenite.
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        }
    };
    tracing::debug!(reason = %reason, "WebSocket reader stopped");
    let _ = tx.send(InboundItem::Lost(reason));
}

#[async_trait]
impl DuplexChannel for WsChannel {
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let text = std::str::from_utf8(buf.trim_ascii_end())
            .map_err(|e| ChannelError::MalformedFrame(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(text.to_owned().into()))
            .await
            .map_err(|e| ChannelError::websocket(e.to_string()))?;
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

            let item = tokio::select! {
                item = inbound.rx.recv() => item,
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
        if let Err(e) = self.sink.lock().await.close().await {
            tracing::debug!(error = %e, "WebSocket close handshake failed");
        }
        self.reader.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_from_endpoint() {
        assert_eq!(
            ws_url("http://localhost:8080/mcp").unwrap().as_str(),
            "ws://localhost:8080/mcp/ws"
        );
        assert_eq!(
            ws_url("https://example.com/mcp/").unwrap().as_str(),
            "wss://example.com/mcp/ws"
        );
        assert_eq!(
            ws_url("ws://127.0.0.1:1/custom").unwrap().as_str(),
            "ws://127.0.0.1:1/custom"
        );
    }

    #[test]
    fn test_ws_url_rejects_other_schemes() {
        assert!(matches!(
            ws_url("ftp://example.com/mcp"),
            Err(ChannelError::InvalidUrl(_))
        ));
        assert!(ws_url("nope").is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 9 (discard) is not listening in test environments.
        let err = WsChannel::connect(WsChannelConfig::new("http://127.0.0.1:9/mcp"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::WebSocket(_)));
    }
}

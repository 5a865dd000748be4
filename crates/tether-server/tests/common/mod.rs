//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use serde_json::{Value, json};
use tether_protocol::{JsonRpcError, headers};
use tether_rpc::{RpcError, Router};
use tether_server::{Server, ServerConfig};
use tether_transport::{
    Client as RpcClient, ClientConfig, HttpChannel, HttpChannelConfig, WsChannel, WsChannelConfig,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Handshake request body.
pub const INITIALIZE: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26","capabilities":{},"clientInfo":{"name":"it","version":"0"}}}"#;

/// Signals from the test handler back to the test.
#[derive(Debug, Default)]
pub struct Signals {
    /// Notified when `wait_for_cancel` starts.
    pub started: Notify,
    /// Notified when `wait_for_cancel` sees its cancellation.
    pub cancel_seen: Notify,
    /// Set once a cancellation was observed.
    pub cancelled: AtomicBool,
}

impl Signals {
    /// Wait until a `wait_for_cancel` handler is running.
    pub async fn wait_started(&self) -> Result<()> {
        timeout(Duration::from_secs(5), self.started.notified()).await?;
        Ok(())
    }

    /// Wait until the handler observed cancellation.
    pub async fn wait_cancelled(&self) -> Result<()> {
        if !self.cancelled.load(Ordering::SeqCst) {
            timeout(Duration::from_secs(5), self.cancel_seen.notified()).await?;
        }
        Ok(())
    }
}

fn internal(e: RpcError) -> JsonRpcError {
    JsonRpcError::internal(e.to_string())
}

/// Handler with the methods the integration tests call.
pub fn test_handler(signals: Arc<Signals>) -> Router {
    Router::new()
        .method("echo", |_ctx, params| async move { Ok(params.unwrap_or(Value::Null)) })
        // Reports 10, 25, 25, 40; the repeated 25 is refused.
        .method("count", |ctx, _params| async move {
            let mut rejected = 0;
            for value in [10.0, 25.0, 25.0, 40.0] {
                match ctx.report_progress(value, Some(40.0), None).await {
                    Ok(()) => {}
                    Err(RpcError::ProgressOrder { .. }) => rejected += 1,
                    Err(e) => return Err(internal(e)),
                }
            }
            // Over HTTP the notifications travel on the event stream and the
            // result in the POST body; let the stream deliver first.
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!({ "rejected": rejected }))
        })
        // Sends `count` notifications before answering.
        .method("emit", |ctx, params| async move {
            let count = params
                .as_ref()
                .and_then(|p| p.get("count"))
                .and_then(Value::as_u64)
                .unwrap_or(1);
            for n in 1..=count {
                ctx.peer()
                    .notify("test/event", Some(json!({ "n": n })))
                    .await
                    .map_err(internal)?;
            }
            Ok(json!(count))
        })
        // Forwards its params to the client's `client/echo`.
        .method("ask_client", |ctx, params| async move {
            ctx.peer()
                .request("client/echo", params)
                .await
                .map_err(internal)
        })
        .method("wait_for_cancel", {
            move |ctx, _params| {
                let signals = Arc::clone(&signals);
                async move {
                    signals.started.notify_one();
                    ctx.cancelled().await;
                    signals.cancelled.store(true, Ordering::SeqCst);
                    signals.cancel_seen.notify_one();
                    Ok(json!("cancelled"))
                }
            }
        })
}

/// A test server that runs in the background.
pub struct TestServer {
    /// The server's address.
    pub addr: SocketAddr,
    /// HTTP client for raw requests.
    pub client: Client,
    /// Handler signals.
    pub signals: Arc<Signals>,
    /// Handle to the server task.
    _handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

impl TestServer {
    /// Start a new test server with default configuration.
    pub async fn start() -> Result<Self> {
        Self::start_with(ServerConfig::default(), |server| server).await
    }

    /// Start a server with a config, letting the test adjust the server.
    pub async fn start_with(
        config: ServerConfig,
        customize: impl FnOnce(Server) -> Server,
    ) -> Result<Self> {
        let addr = find_available_port().await?;
        let signals = Arc::new(Signals::default());

        let config = config.with_bind_address(addr);
        let server = customize(Server::new(test_handler(Arc::clone(&signals)), config));
        let handle = tokio::spawn(async move {
            let _ = server.run_on(addr).await;
        });

        let client = Client::new();
        wait_for_server(&client, addr).await?;

        Ok(Self {
            addr,
            client,
            signals,
            _handle: handle,
        })
    }

    /// Get the base URL for the server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// URL of the session endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}/mcp", self.base_url())
    }

    /// POST one envelope.
    pub async fn post(&self, body: &str, session_id: Option<&str>) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(self.endpoint())
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some(session_id) = session_id {
            request = request.header(headers::SESSION_ID, session_id);
        }
        Ok(request.send().await?)
    }

    /// Open the event stream.
    pub async fn open_stream(
        &self,
        session_id: Option<&str>,
        last_event_id: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .get(self.endpoint())
            .header("accept", "text/event-stream");
        if let Some(session_id) = session_id {
            request = request.header(headers::SESSION_ID, session_id);
        }
        if let Some(last) = last_event_id {
            request = request.header(headers::LAST_EVENT_ID, last);
        }
        Ok(request.send().await?)
    }

    /// Perform the handshake with raw requests, returning the session id.
    pub async fn handshake(&self) -> Result<String> {
        let response = self.post(INITIALIZE, None).await?;
        anyhow::ensure!(response.status().is_success(), "handshake failed");
        let session_id = response
            .headers()
            .get(headers::SESSION_ID)
            .ok_or_else(|| anyhow::anyhow!("no session header"))?
            .to_str()?
            .to_string();
        Ok(session_id)
    }

    /// Connect an initialized client over POST and the event stream.
    pub async fn http_client(&self, handler: Router) -> Result<(RpcClient, Arc<HttpChannel>)> {
        let channel = Arc::new(HttpChannel::connect(HttpChannelConfig::new(self.endpoint()))?);
        let client = RpcClient::with_handler(channel.clone(), handler, client_config());
        client.initialize().await?;
        Ok((client, channel))
    }

    /// Connect an initialized client over a WebSocket.
    pub async fn ws_client(&self, handler: Router) -> Result<RpcClient> {
        let channel = Arc::new(WsChannel::connect(WsChannelConfig::new(self.endpoint())).await?);
        let client = RpcClient::with_handler(channel, handler, client_config());
        client.initialize().await?;
        Ok(client)
    }
}

/// Client settings with short timeouts.
pub fn client_config() -> ClientConfig {
    ClientConfig::default()
        .with_request_timeout(Duration::from_secs(5))
        .with_reconnect_attempts(3)
        .with_reconnect_delay(Duration::from_millis(20))
}

/// Client handler answering `client/echo`.
pub fn client_handler() -> Router {
    Router::new().method("client/echo", |_ctx, params| async move {
        Ok(json!({ "echoed": params }))
    })
}

/// Read an event-stream body until `needle` appears.
pub async fn read_until(response: &mut reqwest::Response, needle: &str) -> Result<String> {
    let mut text = String::new();
    timeout(Duration::from_secs(5), async {
        while !text.contains(needle) {
            match response.chunk().await? {
                Some(chunk) => text.push_str(&String::from_utf8_lossy(&chunk)),
                None => anyhow::bail!("stream ended before {needle:?}: {text:?}"),
            }
        }
        Ok::<(), anyhow::Error>(())
    })
    .await??;
    Ok(text)
}

/// Find an available port for the test server.
async fn find_available_port() -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

/// Wait for the server to become ready.
async fn wait_for_server(client: &Client, addr: SocketAddr) -> Result<()> {
    let url = format!("http://{}/health", addr);

    let result = timeout(Duration::from_secs(5), async {
        loop {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await;

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => anyhow::bail!("Timeout waiting for server to start"),
    }
}

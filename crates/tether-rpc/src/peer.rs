//! Outbound side of a connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tether_protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message, RequestId, methods,
};

use crate::error::{Result, RpcError};
use crate::registry::{RequestRegistry, ResponseWaiter};

/// Default time to wait for a response to an outbound request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Something that can carry a message to the other side.
///
/// Implemented by server sessions (push path) and client channels.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Send one message.
    async fn send(&self, message: Message) -> Result<()>;
}

/// Handle for sending requests and notifications to the other side.
///
/// Cheap to clone; all clones share one registry and sink.
#[derive(Clone)]
pub struct Peer {
    sink: Arc<dyn MessageSink>,
    registry: Arc<RequestRegistry>,
    request_timeout: Duration,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Peer {
    /// Create a peer over a sink and the registry that will see responses.
    pub fn new(sink: Arc<dyn MessageSink>, registry: Arc<RequestRegistry>) -> Self {
        Self {
            sink,
            registry,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the response timeout for outbound requests.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The registry shared with the dispatcher.
    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    /// Send a request and return its result value.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let request = JsonRpcRequest::new(self.registry.next_request_id(), method, params);
        self.send_request(request)
            .await?
            .into_result()
            .map_err(RpcError::Remote)
    }

    /// Send a prepared request and wait for its response.
    ///
    /// On timeout the waiter is dropped and a `notifications/cancelled` is
    /// sent so the other side can stop working on it.
    pub async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = request.id.clone();
        let waiter = self.start_request(request).await?;

        match tokio::time::timeout(self.request_timeout, waiter.recv()).await {
            Ok(response) => response,
            Err(_) => {
                self.registry.abandon(&id);
                tracing::warn!(request_id = %id, "request timed out");
                if let Err(e) = self.cancel(&id, Some("timeout")).await {
                    tracing::debug!(request_id = %id, error = %e, "failed to send cancellation");
                }
                Err(RpcError::Timeout)
            }
        }
    }

    /// Send a request without waiting for the response.
    ///
    /// The waiter is registered before the request goes out.
    pub async fn start_request(&self, request: JsonRpcRequest) -> Result<ResponseWaiter> {
        let id = request.id.clone();
        let waiter = self
            .registry
            .await_response(id.clone(), request.progress_token())?;

        if let Err(e) = self.sink.send(Message::Request(request)).await {
            self.registry.abandon(&id);
            return Err(e);
        }
        Ok(waiter)
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.sink
            .send(Message::Notification(JsonRpcNotification::new(method, params)))
            .await
    }

    /// Ask the other side to cancel a request this side sent.
    pub async fn cancel(&self, id: &RequestId, reason: Option<&str>) -> Result<()> {
        let mut params = json!({ "requestId": id });
        if let Some(reason) = reason {
            params["reason"] = Value::String(reason.to_string());
        }
        self.notify(methods::CANCELLED, Some(params)).await
    }

    /// Send a raw message, typically a response.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.sink.send(message).await
    }
}

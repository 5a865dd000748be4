//! Inbound message dispatch.
//!
//! Requests are registered, run through the middleware chain on their own
//! task and answered only if nothing cancelled them first. Notifications
//! that the transport understands (cancellation and progress) are applied
//! to the registry; responses wake the waiting caller.

use std::sync::Arc;

use tether_protocol::{
    CancelledParams, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message,
    ProgressParams, RequestId, methods,
};
use tokio_util::sync::CancellationToken;

use crate::context::{ChannelContext, RequestContext};
use crate::error::DispatchError;
use crate::handler::Handler;
use crate::middleware::{Middleware, Next};
use crate::registry::RequestRegistry;

/// Routes decoded messages to the handler or the registry.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn Handler>,
    middleware: Arc<Vec<Arc<dyn Middleware>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher for a handler.
    pub fn new(handler: impl Handler + 'static) -> Self {
        Self::from_arc(Arc::new(handler))
    }

    /// Create a dispatcher for a shared handler.
    pub fn from_arc(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            middleware: Arc::new(Vec::new()),
        }
    }

    /// Append a middleware to the end of the chain.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        Arc::make_mut(&mut self.middleware).push(middleware);
        self
    }

    /// Decode a raw envelope and dispatch it.
    ///
    /// Returns the response to send back, if any.
    pub async fn on_message(
        &self,
        raw: &[u8],
        channel: &ChannelContext,
    ) -> Result<Option<JsonRpcResponse>, DispatchError> {
        let message = Message::parse(raw).inspect_err(|e| {
            tracing::warn!(
                session_id = channel.session_id.as_deref().unwrap_or("-"),
                error = %e,
                "malformed message"
            );
        })?;
        Ok(self.dispatch(message, channel).await)
    }

    /// Dispatch an already decoded message.
    pub async fn dispatch(
        &self,
        message: Message,
        channel: &ChannelContext,
    ) -> Option<JsonRpcResponse> {
        match message {
            Message::Request(request) => self.handle_request(request, channel).await,
            Message::Notification(notification) => {
                self.handle_notification(notification, channel).await;
                None
            }
            Message::Response(response) => {
                channel.registry.resolve(response);
                None
            }
        }
    }

    async fn handle_request(
        &self,
        request: JsonRpcRequest,
        channel: &ChannelContext,
    ) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let progress_token = request.progress_token();
        let cancel = CancellationToken::new();

        if let Err(e) = channel.registry.register_with_progress(
            id.clone(),
            cancel.clone(),
            progress_token.clone(),
        ) {
            tracing::warn!(request_id = %id, error = %e, "request rejected");
            return Some(JsonRpcResponse::failure(
                id,
                JsonRpcError::invalid_request(e.to_string()),
            ));
        }

        tracing::debug!(
            request_id = %id,
            method = %request.method,
            session_id = channel.session_id.as_deref().unwrap_or("-"),
            "dispatching request"
        );

        let in_flight = InFlight::new(&channel.registry, id.clone());
        let ctx = RequestContext::new(id.clone(), progress_token, cancel, channel);
        let handler = self.handler.clone();
        let middleware = self.middleware.clone();
        let task = tokio::spawn(async move {
            Next::new(handler.as_ref(), &middleware)
                .run(ctx, request)
                .await
        });

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(request_id = %id, error = %e, "handler task failed");
                let message = if e.is_panic() {
                    "handler panicked"
                } else {
                    "handler task aborted"
                };
                Err(JsonRpcError::internal(message))
            }
        };

        if in_flight.finish() {
            Some(JsonRpcResponse::from_outcome(id, outcome))
        } else {
            tracing::debug!(request_id = %id, "response suppressed after cancellation");
            None
        }
    }

    async fn handle_notification(
        &self,
        notification: JsonRpcNotification,
        channel: &ChannelContext,
    ) {
        match notification.method.as_str() {
            methods::CANCELLED => match notification.parse_params::<CancelledParams>() {
                Ok(params) => channel
                    .registry
                    .cancel(&params.request_id, params.reason.as_deref()),
                Err(e) => tracing::warn!(error = %e, "invalid cancellation params"),
            },
            methods::PROGRESS => {
                let params = match notification.parse_params::<ProgressParams>() {
                    Ok(params) => params,
                    Err(e) => {
                        tracing::warn!(error = %e, "invalid progress params");
                        return;
                    }
                };
                if let Err(e) = channel
                    .registry
                    .update_progress(&params.progress_token, params.progress)
                {
                    tracing::warn!(error = %e, "out-of-order progress dropped");
                    return;
                }
                if !channel.registry.forward_progress(params) {
                    self.handler.notify(channel, notification).await;
                }
            }
            _ => self.handler.notify(channel, notification).await,
        }
    }
}

/// Releases a registered request whose dispatch is dropped before it
/// finishes, so its id can be used again.
struct InFlight<'a> {
    registry: &'a RequestRegistry,
    id: RequestId,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(registry: &'a RequestRegistry, id: RequestId) -> Self {
        Self {
            registry,
            id,
            armed: true,
        }
    }

    /// Complete the request; `true` means its response should be sent.
    fn finish(mut self) -> bool {
        self.armed = false;
        self.registry.complete(&self.id)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.cancel(&self.id, Some("dispatch dropped"));
            self.registry.complete(&self.id);
            tracing::debug!(request_id = %self.id, "dispatch dropped before completion");
        }
    }
}

//! Request handlers and a method-name router.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tether_protocol::{
    Implementation, InitializeParams, InitializeResult, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, MCP_PROTOCOL_VERSION, ServerCapabilities, methods,
};

use crate::context::{ChannelContext, RequestContext};

/// Application logic behind the dispatcher.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle a request and produce its result.
    async fn handle(
        &self,
        ctx: RequestContext,
        request: JsonRpcRequest,
    ) -> Result<Value, JsonRpcError>;

    /// Handle a notification the transport does not interpret itself.
    async fn notify(&self, _channel: &ChannelContext, _notification: JsonRpcNotification) {}
}

type MethodFn = Arc<
    dyn Fn(RequestContext, Option<Value>) -> BoxFuture<'static, Result<Value, JsonRpcError>>
        + Send
        + Sync,
>;

type NotificationFn = Arc<dyn Fn(ChannelContext, Option<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Routes requests to async closures by method name.
///
/// `ping` is always answered, and `initialize` is answered from the
/// configured server info unless a method is registered for it.
#[derive(Clone)]
pub struct Router {
    methods: HashMap<String, MethodFn>,
    notifications: HashMap<String, NotificationFn>,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<_> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("Router")
            .field("methods", &methods)
            .field("server_info", &self.server_info)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            notifications: HashMap::new(),
            server_info: Implementation::default(),
            capabilities: ServerCapabilities::default(),
            instructions: None,
        }
    }

    /// Set the server info returned from `initialize`.
    pub fn with_server_info(mut self, info: Implementation) -> Self {
        self.server_info = info;
        self
    }

    /// Set the capabilities returned from `initialize`.
    pub fn with_capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the instructions returned from `initialize`.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Register a method taking raw params.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JsonRpcError>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Arc::new(move |ctx, params| Box::pin(f(ctx, params))));
        self
    }

    /// Register a method with typed params and result.
    ///
    /// Params that fail to deserialize produce `INVALID_PARAMS`.
    pub fn typed<P, R, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, JsonRpcError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.method(name, move |ctx, params| {
            let f = f.clone();
            async move {
                let params: P = serde_json::from_value(params.unwrap_or(Value::Null))
                    .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
                let result = f(ctx, params).await?;
                serde_json::to_value(result).map_err(|e| JsonRpcError::internal(e.to_string()))
            }
        })
    }

    /// Register a notification listener.
    pub fn on_notification<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ChannelContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.notifications
            .insert(name.into(), Arc::new(move |ctx, params| Box::pin(f(ctx, params))));
        self
    }

    /// Check whether a method is routed.
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name) || name == methods::PING || name == methods::INITIALIZE
    }

    fn initialize(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: InitializeParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;

        tracing::debug!(
            client = %params.client_info.name,
            version = %params.protocol_version,
            "client initializing"
        );

        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: self.capabilities.clone(),
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        };
        serde_json::to_value(result).map_err(|e| JsonRpcError::internal(e.to_string()))
    }
}

#[async_trait]
impl Handler for Router {
    async fn handle(
        &self,
        ctx: RequestContext,
        request: JsonRpcRequest,
    ) -> Result<Value, JsonRpcError> {
        if let Some(method) = self.methods.get(&request.method) {
            return method(ctx, request.params).await;
        }

        match request.method.as_str() {
            methods::PING => Ok(json!({})),
            methods::INITIALIZE => self.initialize(request.params),
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    async fn notify(&self, channel: &ChannelContext, notification: JsonRpcNotification) {
        match self.notifications.get(&notification.method) {
            Some(listener) => listener(channel.clone(), notification.params).await,
            None => {
                tracing::trace!(method = %notification.method, "unhandled notification");
            }
        }
    }
}

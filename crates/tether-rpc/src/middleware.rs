//! Ordered middleware chain in front of the handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tether_protocol::{JsonRpcError, JsonRpcRequest};

use crate::context::RequestContext;
use crate::handler::Handler;

/// A step that runs before the handler.
///
/// A middleware either calls [`Next::run`] to continue down the chain or
/// returns early with an error response.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process a request.
    async fn call(
        &self,
        ctx: RequestContext,
        request: JsonRpcRequest,
        next: Next<'_>,
    ) -> Result<Value, JsonRpcError>;
}

/// The rest of the chain after the current middleware.
pub struct Next<'a> {
    handler: &'a dyn Handler,
    rest: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    /// Start of a chain.
    pub fn new(handler: &'a dyn Handler, middleware: &'a [Arc<dyn Middleware>]) -> Self {
        Self {
            handler,
            rest: middleware,
        }
    }

    /// Run the remaining middleware and then the handler.
    pub async fn run(
        self,
        ctx: RequestContext,
        request: JsonRpcRequest,
    ) -> Result<Value, JsonRpcError> {
        match self.rest.split_first() {
            Some((first, rest)) => {
                let next = Next {
                    handler: self.handler,
                    rest,
                };
                first.call(ctx, request, next).await
            }
            None => self.handler.handle(ctx, request).await,
        }
    }
}

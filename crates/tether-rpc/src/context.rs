//! Per-channel and per-request context handed to handlers.

use std::sync::Arc;

use serde_json::Value;
use tether_protocol::{
    LoggingLevel, LoggingMessageParams, ProgressParams, ProgressToken, RequestId, methods,
};
use tokio_util::sync::CancellationToken;

use crate::auth::Claims;
use crate::error::Result;
use crate::peer::Peer;
use crate::registry::RequestRegistry;

/// Everything the dispatcher needs to know about the channel a message
/// arrived on.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    /// Session the channel belongs to, once one exists.
    pub session_id: Option<String>,
    /// Registry shared by every message on this channel.
    pub registry: Arc<RequestRegistry>,
    /// Outbound side of the channel.
    pub peer: Peer,
    /// Bearer credentials presented with the message, if any.
    pub credentials: Option<String>,
}

impl ChannelContext {
    /// Create a context for a peer, sharing its registry.
    pub fn new(peer: Peer) -> Self {
        Self {
            session_id: None,
            registry: peer.registry().clone(),
            peer,
            credentials: None,
        }
    }

    /// Set the session id.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the bearer credentials.
    pub fn with_credentials(mut self, credentials: Option<String>) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Context for a single inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    session_id: Option<String>,
    cancel: CancellationToken,
    progress_token: Option<ProgressToken>,
    peer: Peer,
    credentials: Option<String>,
    claims: Option<Claims>,
}

impl RequestContext {
    /// Create the context for a request arriving on a channel.
    pub fn new(
        request_id: RequestId,
        progress_token: Option<ProgressToken>,
        cancel: CancellationToken,
        channel: &ChannelContext,
    ) -> Self {
        Self {
            request_id,
            session_id: channel.session_id.clone(),
            cancel,
            progress_token,
            peer: channel.peer.clone(),
            credentials: channel.credentials.clone(),
            claims: None,
        }
    }

    /// The id of the request being handled.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// The session the request belongs to.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Bearer credentials presented with the request.
    pub fn credentials(&self) -> Option<&str> {
        self.credentials.as_deref()
    }

    /// Claims established by authentication middleware.
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    /// Attach authenticated claims.
    pub fn with_claims(mut self, claims: Claims) -> Self {
        self.claims = Some(claims);
        self
    }

    /// The token that fires when the request is cancelled.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Check whether the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the request is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The progress token the caller supplied, if any.
    pub fn progress_token(&self) -> Option<&ProgressToken> {
        self.progress_token.as_ref()
    }

    /// Send a progress notification for this request.
    ///
    /// Does nothing if the caller did not ask for progress. A value that is
    /// not strictly greater than the last one fails with
    /// [`RpcError::ProgressOrder`](crate::RpcError::ProgressOrder) and is
    /// not sent.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<()> {
        let Some(token) = &self.progress_token else {
            return Ok(());
        };
        self.peer.registry().update_progress(token, progress)?;

        let params = ProgressParams {
            progress_token: token.clone(),
            progress,
            total,
            message,
        };
        self.peer
            .notify(methods::PROGRESS, Some(serde_json::to_value(params)?))
            .await
    }

    /// Send a log message to the client.
    pub async fn log(&self, level: LoggingLevel, data: Value) -> Result<()> {
        let params = LoggingMessageParams {
            level,
            logger: None,
            data,
        };
        self.peer
            .notify(methods::LOG_MESSAGE, Some(serde_json::to_value(params)?))
            .await
    }

    /// Handle for requests to the other side.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}

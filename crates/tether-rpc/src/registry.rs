//! Request registry.
//!
//! One registry exists per session (server side) or per connection (client
//! side). It owns three tables:
//!
//! - pending inbound requests, each with the cancel token of its handler task
//! - outbound waiters for requests this side sent and is awaiting answers to
//! - the last accepted value per progress token
//!
//! A request that has been cancelled is marked completed, so the handler's
//! eventual [`RequestRegistry::complete`] returns `false` and no response is
//! sent for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tether_protocol::{JsonRpcResponse, ProgressParams, ProgressToken, RequestId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};

/// An inbound request whose handler has not finished yet.
#[derive(Debug)]
struct PendingRequest {
    cancel: CancellationToken,
    created_at: Instant,
    completed: bool,
    progress_token: Option<ProgressToken>,
}

/// A caller waiting for the response to a request it sent.
#[derive(Debug)]
struct OutboundWaiter {
    tx: oneshot::Sender<JsonRpcResponse>,
    progress_token: Option<ProgressToken>,
}

/// Last accepted progress for one token.
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// The progress token.
    pub token: ProgressToken,
    /// Last accepted value, if any update has been accepted yet.
    pub last_value: Option<f64>,
    listener: Option<mpsc::UnboundedSender<ProgressParams>>,
}

/// Receives the response to an outbound request.
#[derive(Debug)]
pub struct ResponseWaiter {
    id: RequestId,
    rx: oneshot::Receiver<JsonRpcResponse>,
}

impl ResponseWaiter {
    /// The id of the request being awaited.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response.
    ///
    /// Fails with [`RpcError::ChannelClosed`] if the registry is released
    /// or the waiter is abandoned before a response arrives.
    pub async fn recv(self) -> Result<JsonRpcResponse> {
        self.rx.await.map_err(|_| RpcError::ChannelClosed)
    }
}

/// Correlates requests, responses, cancellation and progress.
#[derive(Debug)]
pub struct RequestRegistry {
    inbound: Mutex<HashMap<RequestId, PendingRequest>>,
    outbound: Mutex<HashMap<RequestId, OutboundWaiter>>,
    progress: Mutex<HashMap<ProgressToken, ProgressState>>,
    next_id: AtomicI64,
    released: AtomicBool,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            released: AtomicBool::new(false),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound requests
    // ─────────────────────────────────────────────────────────────────────

    /// Register an inbound request with the token that cancels its handler.
    pub fn register(&self, id: RequestId, cancel: CancellationToken) -> Result<()> {
        self.register_with_progress(id, cancel, None)
    }

    /// Register an inbound request that asked for progress updates.
    pub fn register_with_progress(
        &self,
        id: RequestId,
        cancel: CancellationToken,
        progress_token: Option<ProgressToken>,
    ) -> Result<()> {
        if self.is_released() {
            return Err(RpcError::ChannelClosed);
        }

        let mut inbound = self.inbound.lock();
        if inbound.contains_key(&id) {
            return Err(RpcError::DuplicateRequest(id));
        }
        inbound.insert(
            id,
            PendingRequest {
                cancel,
                created_at: Instant::now(),
                completed: false,
                progress_token,
            },
        );
        Ok(())
    }

    /// Mark an inbound request finished and remove it.
    ///
    /// Returns `true` if the caller should send the response, and `false`
    /// if the request was cancelled first or is unknown.
    pub fn complete(&self, id: &RequestId) -> bool {
        let Some(entry) = self.inbound.lock().remove(id) else {
            return false;
        };

        if let Some(token) = &entry.progress_token {
            self.clear_progress(token);
        }

        if entry.completed {
            tracing::debug!(
                request_id = %id,
                elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                "request finished after cancellation"
            );
            return false;
        }
        true
    }

    /// Cancel an inbound request.
    ///
    /// Unknown or already completed requests are ignored.
    pub fn cancel(&self, id: &RequestId, reason: Option<&str>) {
        let mut inbound = self.inbound.lock();
        let Some(entry) = inbound.get_mut(id) else {
            tracing::debug!(request_id = %id, "cancel for unknown request ignored");
            return;
        };
        if entry.completed {
            return;
        }

        entry.completed = true;
        entry.cancel.cancel();
        tracing::debug!(request_id = %id, reason = reason.unwrap_or(""), "request cancelled");
    }

    /// Check whether an inbound request is still awaiting completion.
    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.inbound
            .lock()
            .get(id)
            .is_some_and(|entry| !entry.completed)
    }

    /// Number of registered inbound requests.
    pub fn len(&self) -> usize {
        self.inbound.lock().len()
    }

    /// Check if no inbound requests are registered.
    pub fn is_empty(&self) -> bool {
        self.inbound.lock().is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Progress
    // ─────────────────────────────────────────────────────────────────────

    /// Record a progress value for a token.
    ///
    /// The first value for a token is always accepted; every later value
    /// must be strictly greater than the last accepted one.
    ///
    /// Only tokens owned by a registered request or a subscriber are
    /// tracked. Updates for any other token are accepted without keeping
    /// state, so a stray token cannot grow the table.
    pub fn update_progress(&self, token: &ProgressToken, value: f64) -> Result<()> {
        // Always inbound, then outbound, then progress.
        let inbound = self.inbound.lock();
        let outbound = self.outbound.lock();
        let mut progress = self.progress.lock();

        let owned = progress.contains_key(token)
            || inbound
                .values()
                .any(|entry| entry.progress_token.as_ref() == Some(token))
            || outbound
                .values()
                .any(|waiter| waiter.progress_token.as_ref() == Some(token));
        drop(outbound);
        drop(inbound);
        if !owned {
            tracing::debug!(progress_token = %token, "progress for unowned token not tracked");
            return Ok(());
        }

        let state = progress
            .entry(token.clone())
            .or_insert_with(|| ProgressState {
                token: token.clone(),
                last_value: None,
                listener: None,
            });

        // NaN never compares greater, so it is rejected as well.
        let in_order = match state.last_value {
            Some(last) => value > last,
            None => !value.is_nan(),
        };
        if !in_order {
            return Err(RpcError::ProgressOrder {
                token: token.clone(),
                last: state.last_value.unwrap_or(f64::NAN),
                attempted: value,
            });
        }
        state.last_value = Some(value);
        Ok(())
    }

    /// Last accepted progress value for a token.
    pub fn last_progress(&self, token: &ProgressToken) -> Option<f64> {
        self.progress
            .lock()
            .get(token)
            .and_then(|state| state.last_value)
    }

    /// Forget the progress state of a token.
    pub fn clear_progress(&self, token: &ProgressToken) {
        self.progress.lock().remove(token);
    }

    /// Receive accepted progress updates for a token.
    ///
    /// Replaces any earlier subscription for the same token.
    pub fn subscribe_progress(
        &self,
        token: ProgressToken,
    ) -> mpsc::UnboundedReceiver<ProgressParams> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.progress
            .lock()
            .entry(token.clone())
            .or_insert_with(|| ProgressState {
                token,
                last_value: None,
                listener: None,
            })
            .listener = Some(tx);
        rx
    }

    /// Hand an accepted progress update to its subscriber.
    ///
    /// Returns `false` if nobody subscribed to the token.
    pub fn forward_progress(&self, params: ProgressParams) -> bool {
        let progress = self.progress.lock();
        match progress
            .get(&params.progress_token)
            .and_then(|state| state.listener.as_ref())
        {
            Some(listener) => listener.send(params).is_ok(),
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbound requests
    // ─────────────────────────────────────────────────────────────────────

    /// Allocate an id for an outbound request.
    pub fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Start waiting for the response to an outbound request.
    ///
    /// Must be called before the request is sent so a fast response cannot
    /// slip past.
    pub fn await_response(
        &self,
        id: RequestId,
        progress_token: Option<ProgressToken>,
    ) -> Result<ResponseWaiter> {
        if self.is_released() {
            return Err(RpcError::ChannelClosed);
        }

        let (tx, rx) = oneshot::channel();
        let mut outbound = self.outbound.lock();
        if outbound.contains_key(&id) {
            return Err(RpcError::DuplicateRequest(id));
        }
        outbound.insert(id.clone(), OutboundWaiter { tx, progress_token });
        Ok(ResponseWaiter { id, rx })
    }

    /// Deliver a response to its waiter.
    ///
    /// Returns `false` if nobody is waiting for this id.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(waiter) = self.outbound.lock().remove(&response.id) else {
            tracing::debug!(request_id = %response.id, "response for unknown request dropped");
            return false;
        };

        if let Some(token) = &waiter.progress_token {
            self.clear_progress(token);
        }
        waiter.tx.send(response).is_ok()
    }

    /// Stop waiting for an outbound request.
    pub fn abandon(&self, id: &RequestId) {
        if let Some(waiter) = self.outbound.lock().remove(id)
            && let Some(token) = &waiter.progress_token
        {
            self.clear_progress(token);
        }
    }

    /// Number of outbound requests awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.outbound.lock().len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────

    /// Release everything the registry holds.
    ///
    /// Fires every pending cancel token and fails every outbound waiter with
    /// [`RpcError::ChannelClosed`]. Later registrations are refused.
    pub fn release_all(&self) {
        self.released.store(true, Ordering::SeqCst);

        let inbound: Vec<_> = self.inbound.lock().drain().collect();
        for (id, entry) in &inbound {
            if !entry.completed {
                entry.cancel.cancel();
                tracing::trace!(request_id = %id, "cancelled on release");
            }
        }

        // Dropping the senders wakes every waiter with ChannelClosed.
        let outbound: Vec<_> = self.outbound.lock().drain().collect();
        self.progress.lock().clear();

        if !inbound.is_empty() || !outbound.is_empty() {
            tracing::debug!(
                inbound = inbound.len(),
                outbound = outbound.len(),
                "request registry released"
            );
        }
    }

    /// Check whether [`release_all`](Self::release_all) has run.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(n: i64) -> RequestId {
        RequestId::Number(n)
    }

    #[test]
    fn test_register_and_complete() {
        let registry = RequestRegistry::new();
        registry.register(id(1), CancellationToken::new()).unwrap();
        assert!(registry.is_pending(&id(1)));
        assert_eq!(registry.len(), 1);

        assert!(registry.complete(&id(1)));
        assert!(!registry.is_pending(&id(1)));
        assert!(registry.is_empty());
        assert!(!registry.complete(&id(1)));
    }

    #[test]
    fn test_duplicate_outstanding_id_rejected() {
        let registry = RequestRegistry::new();
        registry.register(id(1), CancellationToken::new()).unwrap();
        let err = registry
            .register(id(1), CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, RpcError::DuplicateRequest(_)));

        // Once completed the id may be reused.
        registry.complete(&id(1));
        registry.register(id(1), CancellationToken::new()).unwrap();
    }

    #[test]
    fn test_cancel_fires_token_and_suppresses_response() {
        let registry = RequestRegistry::new();
        let token = CancellationToken::new();
        registry.register(id(7), token.clone()).unwrap();

        registry.cancel(&id(7), Some("user"));
        assert!(token.is_cancelled());
        assert!(!registry.is_pending(&id(7)));
        assert!(!registry.complete(&id(7)));
    }

    #[test]
    fn test_cancel_after_complete_is_noop() {
        let registry = RequestRegistry::new();
        let token = CancellationToken::new();
        registry.register(id(3), token.clone()).unwrap();

        assert!(registry.complete(&id(3)));
        registry.cancel(&id(3), Some("timeout"));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_unknown_and_twice() {
        let registry = RequestRegistry::new();
        registry.cancel(&id(99), None);

        let token = CancellationToken::new();
        registry.register(id(4), token.clone()).unwrap();
        registry.cancel(&id(4), None);
        registry.cancel(&id(4), None);
        assert!(token.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_progress_strictly_increasing() {
        let registry = RequestRegistry::new();
        let token = ProgressToken::from("p");
        registry
            .register_with_progress(id(1), CancellationToken::new(), Some(token.clone()))
            .unwrap();

        let mut accepted = Vec::new();
        let mut rejected = 0;
        for value in [10.0, 25.0, 25.0, 40.0] {
            match registry.update_progress(&token, value) {
                Ok(()) => accepted.push(value),
                Err(RpcError::ProgressOrder { last, attempted, .. }) => {
                    assert_eq!(last, 25.0);
                    assert_eq!(attempted, 25.0);
                    rejected += 1;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(accepted, vec![10.0, 25.0, 40.0]);
        assert_eq!(rejected, 1);
        assert_eq!(registry.last_progress(&token), Some(40.0));
    }

    #[test]
    fn test_progress_decrease_not_clamped() {
        let registry = RequestRegistry::new();
        let token = ProgressToken::from(1);
        let _waiter = registry.await_response(id(7), Some(token.clone())).unwrap();
        registry.update_progress(&token, 50.0).unwrap();
        assert!(registry.update_progress(&token, 10.0).is_err());
        assert_eq!(registry.last_progress(&token), Some(50.0));
        assert!(registry.update_progress(&token, f64::NAN).is_err());
    }

    #[test]
    fn test_progress_cleared_on_complete() {
        let registry = RequestRegistry::new();
        let token = ProgressToken::from("job");
        registry
            .register_with_progress(id(1), CancellationToken::new(), Some(token.clone()))
            .unwrap();
        registry.update_progress(&token, 90.0).unwrap();

        registry.complete(&id(1));
        assert_eq!(registry.last_progress(&token), None);
        // A late update after completion is not tracked again.
        registry.update_progress(&token, 1.0).unwrap();
        assert_eq!(registry.last_progress(&token), None);
    }

    #[test]
    fn test_progress_for_unowned_token_not_tracked() {
        let registry = RequestRegistry::new();
        registry
            .register_with_progress(
                id(1),
                CancellationToken::new(),
                Some(ProgressToken::from("mine")),
            )
            .unwrap();

        for n in 0..100 {
            let stray = ProgressToken::from(format!("stray-{n}"));
            registry.update_progress(&stray, 5.0).unwrap();
            registry.update_progress(&stray, 1.0).unwrap();
            assert_eq!(registry.last_progress(&stray), None);
        }
        assert!(registry.progress.lock().is_empty());

        let mine = ProgressToken::from("mine");
        registry.update_progress(&mine, 5.0).unwrap();
        assert!(registry.update_progress(&mine, 1.0).is_err());
        assert_eq!(registry.progress.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_outbound_resolve() {
        let registry = RequestRegistry::new();
        let request_id = registry.next_request_id();
        let waiter = registry.await_response(request_id.clone(), None).unwrap();
        assert_eq!(registry.outstanding(), 1);

        assert!(registry.resolve(JsonRpcResponse::success(
            request_id.clone(),
            json!({"ok": true})
        )));
        let response = waiter.recv().await.unwrap();
        assert_eq!(response.id, request_id);
        assert_eq!(registry.outstanding(), 0);

        // A second response for the same id has nobody to go to.
        assert!(!registry.resolve(JsonRpcResponse::success(request_id, json!(null))));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let registry = RequestRegistry::new();
        let a = registry.next_request_id();
        let b = registry.next_request_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_abandon_fails_waiter() {
        let registry = RequestRegistry::new();
        let waiter = registry.await_response(id(5), None).unwrap();
        registry.abandon(&id(5));
        assert!(matches!(waiter.recv().await, Err(RpcError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_release_all() {
        let registry = RequestRegistry::new();
        let token = CancellationToken::new();
        registry.register(id(1), token.clone()).unwrap();
        let waiter = registry.await_response(id(100), None).unwrap();

        registry.release_all();

        assert!(token.is_cancelled());
        assert!(matches!(waiter.recv().await, Err(RpcError::ChannelClosed)));
        assert!(registry.is_empty());
        assert!(matches!(
            registry.register(id(2), CancellationToken::new()),
            Err(RpcError::ChannelClosed)
        ));
        assert!(matches!(
            registry.await_response(id(101), None),
            Err(RpcError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_progress_subscription() {
        let registry = RequestRegistry::new();
        let token = ProgressToken::from("sub");
        let mut rx = registry.subscribe_progress(token.clone());

        registry.update_progress(&token, 5.0).unwrap();
        assert!(registry.forward_progress(ProgressParams {
            progress_token: token.clone(),
            progress: 5.0,
            total: None,
            message: None,
        }));
        assert_eq!(rx.recv().await.unwrap().progress, 5.0);

        assert!(!registry.forward_progress(ProgressParams {
            progress_token: ProgressToken::from("other"),
            progress: 1.0,
            total: None,
            message: None,
        }));
    }
}

//! WebSocket endpoint: one JSON-RPC envelope per text frame.
//!
//! The first `initialize` on a fresh connection creates a session. A
//! connection opened with `Mcp-Session-Id` takes over that session's push
//! path instead, replaying from `Last-Event-ID` when given.

use std::pin::Pin;
use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::json;
use tether_protocol::{JsonRpcError, JsonRpcResponse, Message, methods};
use tether_rpc::DispatchError;
use tether_session::{PushFrame, PushStream, Session};

use super::mcp::{last_event_id, session_header};
use crate::auth::bearer_token;
use crate::error::Result;
use crate::state::AppState;

type FrameStream = Pin<Box<dyn Stream<Item = PushFrame> + Send>>;

enum Event {
    Incoming(Option<std::result::Result<WsMessage, axum::Error>>),
    Push(Option<PushFrame>),
}

/// Upgrade to a WebSocket.
///
/// Resume failures are reported before the upgrade with the same status
/// codes as the event stream endpoint.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    let credentials = bearer_token(&headers);
    let resumed = match session_header(&headers)? {
        Some(session_id) => {
            let last_event_id = last_event_id(&headers)?;
            let session = state.sessions.get(&session_id)?;
            let stream = session.attach(last_event_id)?;
            tracing::debug!(%session_id, ?last_event_id, "WebSocket resuming session");
            Some((session, stream))
        }
        None => None,
    };

    let max_message_size = state.config().max_ws_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, resumed, credentials)))
}

/// Per-connection state.
struct Connection {
    state: AppState,
    credentials: Option<String>,
    session: Option<Arc<Session>>,
    frames: Option<FrameStream>,
}

impl Connection {
    fn attach(&mut self, session: Arc<Session>, stream: PushStream) {
        let keepalive = self.state.config().session.keepalive_interval;
        self.frames = Some(Box::pin(stream.into_frames(keepalive)));
        self.session = Some(session);
    }

    async fn next_frame(&mut self) -> Option<PushFrame> {
        match self.frames.as_mut() {
            Some(frames) => frames.next().await,
            None => futures::future::pending().await,
        }
    }

    /// Handle one inbound envelope, returning a reply to send directly.
    async fn handle_text(&mut self, text: &str) -> Option<String> {
        let message = match Message::parse(text.as_bytes()) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "malformed WebSocket message");
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": DispatchError::from(e).to_jsonrpc(),
                });
                return Some(body.to_string());
            }
        };

        let Some(session) = self.session.clone() else {
            return self.handle_unbound(message).await;
        };
        let context = session.channel_context(self.credentials.clone());

        match message {
            Message::Request(request) => {
                // Responses travel through the session so they can be replayed.
                let dispatcher = self.state.dispatcher.clone();
                tokio::spawn(async move {
                    let message = Message::Request(request);
                    if let Some(response) = dispatcher.dispatch(message, &context).await {
                        if let Err(e) = session.push(&Message::Response(response)) {
                            tracing::debug!(error = %e, "dropping response for closed session");
                        }
                    }
                });
                None
            }
            message => {
                self.state.dispatcher.dispatch(message, &context).await;
                None
            }
        }
    }

    /// Before the handshake only `initialize` is accepted.
    async fn handle_unbound(&mut self, message: Message) -> Option<String> {
        let request = match message {
            Message::Request(request) if request.method == methods::INITIALIZE => request,
            Message::Request(request) => {
                let response = JsonRpcResponse::failure(
                    request.id,
                    JsonRpcError::invalid_request("session not initialized"),
                );
                return encode(response);
            }
            _ => {
                tracing::debug!("ignoring message before initialize");
                return None;
            }
        };

        let session = self.state.sessions.create();
        let context = session.channel_context(self.credentials.clone());
        let response = self
            .state
            .dispatcher
            .dispatch(Message::Request(request), &context)
            .await;

        let response = match response {
            Some(response) if !response.is_error() => response,
            other => {
                self.state.sessions.remove(session.id().as_str());
                session.close();
                return other.and_then(encode);
            }
        };

        session.activate();
        match session.attach(None) {
            Ok(stream) => {
                tracing::info!(session_id = %session.id(), "WebSocket session initialized");
                self.attach(session, stream);
            }
            Err(e) => tracing::warn!(error = %e, "failed to attach push stream"),
        }
        encode(response)
    }
}

fn encode(response: JsonRpcResponse) -> Option<String> {
    match Message::Response(response).to_json() {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode response");
            None
        }
    }
}

async fn send_text(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    text: impl Into<String>,
) -> bool {
    sender.send(WsMessage::Text(text.into().into())).await.is_ok()
}

/// Drive one WebSocket connection.
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    resumed: Option<(Arc<Session>, PushStream)>,
    credentials: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut conn = Connection {
        state,
        credentials,
        session: None,
        frames: None,
    };
    if let Some((session, stream)) = resumed {
        conn.attach(session, stream);
    }

    tracing::debug!("WebSocket connection established");

    loop {
        let event = tokio::select! {
            incoming = receiver.next() => Event::Incoming(incoming),
            frame = conn.next_frame() => Event::Push(frame),
        };

        match event {
            Event::Incoming(incoming) => {
                // Binary frames are accepted if they hold UTF-8 JSON.
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!("rejecting non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "WebSocket receive failed");
                        break;
                    }
                };

                if let Some(session) = &conn.session {
                    session.touch();
                }
                if let Some(reply) = conn.handle_text(&text).await {
                    if !send_text(&mut sender, reply).await {
                        break;
                    }
                }
            }
            Event::Push(frame) => {
                let sent = match frame {
                    Some(PushFrame::Event(record)) => {
                        send_text(&mut sender, &*record.payload).await
                    }
                    Some(PushFrame::Keepalive) => sender
                        .send(WsMessage::Ping(Default::default()))
                        .await
                        .is_ok(),
                    None => {
                        // Session closed, expired or taken over by another stream.
                        let _ = sender.send(WsMessage::Close(None)).await;
                        break;
                    }
                };
                if !sent {
                    break;
                }
            }
        }
    }

    let session_id = conn.session.as_ref().map(|s| s.id().to_string());
    tracing::debug!(session_id = ?session_id, "WebSocket connection closed");
}

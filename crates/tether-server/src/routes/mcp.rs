//! The session endpoint: POST for client messages, GET for the event
//! stream, DELETE to end the session.

use std::io;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use futures::{Stream, StreamExt};
use serde_json::json;
use tether_protocol::{
    EventId, JsonRpcRequest, JsonRpcResponse, Message, SseCodec, SseEvent, headers, methods,
};
use tether_rpc::DispatchError;
use tether_session::{PushFrame, Session};
use tokio_util::codec::Encoder;

use crate::auth::bearer_token;
use crate::error::{Result, ServerError};
use crate::state::AppState;

/// The session id header, if present.
pub(crate) fn session_header(headers: &HeaderMap) -> Result<Option<String>> {
    headers
        .get(headers::SESSION_ID)
        .map(|value| {
            value
                .to_str()
                .map(str::to_string)
                .map_err(|_| ServerError::bad_request("invalid Mcp-Session-Id header"))
        })
        .transpose()
}

fn require_session_header(headers: &HeaderMap) -> Result<String> {
    session_header(headers)?.ok_or_else(|| ServerError::bad_request("missing Mcp-Session-Id header"))
}

/// The `Last-Event-ID` header, if present.
pub(crate) fn last_event_id(headers: &HeaderMap) -> Result<Option<EventId>> {
    headers
        .get(headers::LAST_EVENT_ID)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<EventId>().ok())
                .ok_or_else(|| ServerError::bad_request("Last-Event-ID must be an integer"))
        })
        .transpose()
}

fn header_contains(headers: &HeaderMap, name: HeaderName, needle: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(needle))
}

fn session_id_value(session: &Session) -> Result<HeaderValue> {
    HeaderValue::from_str(session.id().as_str())
        .map_err(|e| ServerError::internal(format!("session id not a header value: {e}")))
}

/// 400 with a JSON-RPC error body whose id is null.
fn malformed_response(error: DispatchError) -> Response {
    let body = json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": error.to_jsonrpc(),
    });
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// POST
// ─────────────────────────────────────────────────────────────────────────────

/// POST: one JSON-RPC envelope from the client.
///
/// Requests are answered with 200 and the response body. A client that
/// accepts `text/event-stream` gets the response as a single event on a
/// stream whose headers are sent before the handler runs; a response
/// suppressed by cancellation ends that stream empty. Notifications,
/// responses and suppressed responses on the JSON path are answered with
/// 202.
pub async fn post_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    if !header_contains(&headers, CONTENT_TYPE, "application/json") {
        return Err(ServerError::bad_request(
            "Content-Type must be application/json",
        ));
    }

    let message = match Message::parse(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "malformed message");
            return Ok(malformed_response(DispatchError::from(e)));
        }
    };
    let credentials = bearer_token(&headers);

    match message {
        Message::Request(request) if request.method == methods::INITIALIZE => {
            initialize(&state, request, credentials).await
        }
        message => dispatch(&state, &headers, message, credentials).await,
    }
}

async fn initialize(
    state: &AppState,
    request: JsonRpcRequest,
    credentials: Option<String>,
) -> Result<Response> {
    let session = state.sessions.create();
    let context = session.channel_context(credentials);

    let response = state
        .dispatcher
        .dispatch(Message::Request(request), &context)
        .await;

    match response {
        Some(response) if !response.is_error() => {
            session.activate();
            let mut reply = (StatusCode::OK, Json(response)).into_response();
            reply.headers_mut().insert(
                HeaderName::from_static(headers::SESSION_ID),
                session_id_value(&session)?,
            );
            Ok(reply)
        }
        other => {
            // A failed handshake leaves no session behind.
            state.sessions.remove(session.id().as_str());
            session.close();
            Ok(match other {
                Some(response) => (StatusCode::OK, Json(response)).into_response(),
                None => StatusCode::ACCEPTED.into_response(),
            })
        }
    }
}

async fn dispatch(
    state: &AppState,
    headers: &HeaderMap,
    message: Message,
    credentials: Option<String>,
) -> Result<Response> {
    let session_id = require_session_header(headers)?;
    let session = state.sessions.get(&session_id)?;
    let context = session.channel_context(credentials);

    if message.is_request() && header_contains(headers, ACCEPT, "text/event-stream") {
        let dispatcher = state.dispatcher.clone();
        let reply = futures::stream::once(async move { dispatcher.dispatch(message, &context).await })
            .filter_map(|response| async move { response })
            .map(encode_response);
        return event_stream_response(Body::from_stream(reply), &session);
    }

    let response: Option<JsonRpcResponse> = state.dispatcher.dispatch(message, &context).await;
    Ok(match response {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// GET
// ─────────────────────────────────────────────────────────────────────────────

/// GET: the session's event stream.
///
/// With `Last-Event-ID` the stream starts with every event after that id;
/// without it, with every event not yet delivered. A replaced or closed
/// stream ends.
pub async fn get_handler(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    if !header_contains(&headers, ACCEPT, "text/event-stream") {
        return Err(ServerError::bad_request(
            "Accept must include text/event-stream",
        ));
    }
    let session_id = require_session_header(&headers)?;
    let last_event_id = last_event_id(&headers)?;

    let session = state.sessions.get(&session_id)?;
    let stream = session.attach(last_event_id)?;
    tracing::debug!(%session_id, ?last_event_id, "event stream attached");

    let frames = stream.into_frames(state.config().session.keepalive_interval);
    event_stream_response(Body::from_stream(encode_frames(frames)), &session)
}

fn event_stream_response(body: Body, session: &Session) -> Result<Response> {
    let mut response = Response::new(body);
    let response_headers = response.headers_mut();
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    response_headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response_headers.insert(
        HeaderName::from_static(headers::SESSION_ID),
        session_id_value(session)?,
    );
    Ok(response)
}

/// Encode a POST reply as one unnumbered event.
fn encode_response(response: JsonRpcResponse) -> io::Result<Bytes> {
    let json = Message::Response(response)
        .to_json()
        .map_err(io::Error::other)?;
    let mut buf = BytesMut::new();
    SseCodec::new().encode(&SseEvent::new(json), &mut buf)?;
    Ok(buf.freeze())
}

/// Encode push frames as event-stream bytes.
pub(crate) fn encode_frames(
    frames: impl Stream<Item = PushFrame> + Send + 'static,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let mut codec = SseCodec::new();
    frames.map(move |frame| {
        let mut buf = BytesMut::new();
        match frame {
            PushFrame::Event(record) => {
                let event = SseEvent::new(&*record.payload).with_id(record.id);
                codec.encode(&event, &mut buf)?;
            }
            PushFrame::Keepalive => codec.encode_comment("keepalive", &mut buf)?,
        }
        Ok(buf.freeze())
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// DELETE
// ─────────────────────────────────────────────────────────────────────────────

/// DELETE: close the session.
pub async fn delete_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let session_id = require_session_header(&headers)?;
    state.sessions.close(&session_id)?;
    Ok(StatusCode::OK)
}

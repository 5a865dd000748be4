//! Wire-level building blocks for Tether.
//!
//! Two concerns live here:
//!
//! - [`message`]: the JSON-RPC 2.0 envelope (request, response, notification)
//!   and the classification rules that turn a decoded JSON object into a
//!   [`Message`].
//! - [`codec`]: the event-stream framing used on the server push path
//!   (`id:` / `data:` lines terminated by a blank line), exposed as a
//!   [`tokio_util::codec`] decoder/encoder pair so it composes with
//!   `FramedRead` over any byte stream.
//!
//! ```text
//! bytes ──► SseCodec::decode ──► SseFrame::Event ──► Message::parse ──► Message
//! Message ──► SseEvent::from_message ──► SseCodec::encode ──► bytes
//! ```
//!
//! The parameter shapes of the few methods the transport interprets itself
//! (initialize, cancellation, progress, logging) are in [`types`].

pub mod codec;
pub mod error;
pub mod message;
pub mod types;

pub use codec::{DEFAULT_MAX_LINE_LENGTH, EventId, SseCodec, SseEvent, SseFrame};
pub use error::{ProtocolError, Result};
pub use message::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message,
    ProgressToken, RequestId,
};
pub use types::{
    CancelledParams, ClientCapabilities, Implementation, InitializeParams, InitializeResult,
    LoggingLevel, LoggingMessageParams, MCP_PROTOCOL_VERSION, ProgressParams, ServerCapabilities,
    headers, methods,
};

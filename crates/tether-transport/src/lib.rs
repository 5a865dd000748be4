//! Client side of the Tether transport.
//!
//! A [`DuplexChannel`] turns a pair of unidirectional HTTP primitives (POST
//! for client→server, an event stream via GET for server→client) into one
//! bidirectional byte stream of newline-delimited JSON envelopes:
//!
//! ```text
//! write(envelope) ──► POST /mcp ──► 200 JSON | 202 | SSE body ─┐
//!                                                              ├─► inbound queue ──► read()
//!                     GET /mcp (Last-Event-ID) ──► SSE frames ─┘
//! ```
//!
//! [`WsChannel`] offers the same contract over a WebSocket. [`Client`]
//! drives either channel: it correlates requests with responses, dispatches
//! server-initiated requests to a handler and resumes the event stream after
//! a dropped connection.

pub mod channel;
pub mod client;
pub mod error;
pub mod http;
pub mod ws;

pub use channel::DuplexChannel;
pub use client::{Client, ClientConfig, PendingCall};
pub use error::{ChannelError, Result};
pub use http::{HttpChannel, HttpChannelConfig};
pub use ws::{WsChannel, WsChannelConfig};

//! Event-stream framing for the server push path.
//!
//! ```text
//! id: 7
//! data: {"jsonrpc":"2.0","method":"notifications/progress",...}
//!
//! : keepalive
//!
//! ```
//!
//! An event is one or more `data:` lines followed by exactly one blank line.
//! A leading `id:` line sets the event id used for resumption. Lines starting
//! with `:` are comments; they never produce events but are surfaced as
//! [`SseFrame::Comment`] so readers can reset idle timers.
//!
//! Decoding is incremental: [`SseCodec`] keeps partial lines in the
//! `BytesMut` buffer between calls and only consumes complete lines, so any
//! split of the input produces the same frames. A frame that cannot be
//! decoded is reported as [`SseFrame::Malformed`] once its blank-line
//! boundary is reached and the stream continues with the next frame.

use std::fmt::Write as _;
use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::Result;
use crate::message::Message;

/// Per-session event identifier.
pub type EventId = u64;

/// Default upper bound for a single line (8 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// A decoded (or to-be-encoded) event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// Event id, if the frame carried one.
    pub id: Option<EventId>,
    /// Event type, if the frame carried one.
    pub event: Option<String>,
    /// Concatenated `data:` lines.
    pub data: String,
}

impl SseEvent {
    /// Create an event carrying `data`.
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: None,
            data: data.into(),
        }
    }

    /// Set the event id.
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the event type.
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Build an event whose payload is a serialized envelope.
    pub fn from_message(id: Option<EventId>, message: &Message) -> Result<Self> {
        Ok(Self {
            id,
            event: None,
            data: message.to_json()?,
        })
    }

    /// Parse the payload as an envelope.
    pub fn message(&self) -> Result<Message> {
        Message::parse(self.data.as_bytes())
    }
}

/// One unit produced by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A complete event.
    Event(SseEvent),
    /// A comment line (keepalive); carries the text after the colon.
    Comment(String),
    /// A frame that could not be decoded; input was skipped to its boundary.
    Malformed(String),
}

#[derive(Debug, Default)]
struct PendingEvent {
    id: Option<EventId>,
    event: Option<String>,
    data: String,
    has_data: bool,
}

/// Incremental event-stream decoder and encoder.
#[derive(Debug)]
pub struct SseCodec {
    max_line_length: usize,
    pending: PendingEvent,
    /// Set once the current frame is known to be bad.
    malformed: Option<String>,
    /// Dropping the tail of an overlong line.
    discarding_line: bool,
    /// Where to resume the newline search in the buffer.
    next_index: usize,
}

impl Default for SseCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SseCodec {
    /// Create a codec with the default line limit.
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Create a codec with a custom line limit.
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            pending: PendingEvent::default(),
            malformed: None,
            discarding_line: false,
            next_index: 0,
        }
    }

    /// Encode a comment frame (`: text` followed by the blank terminator).
    pub fn encode_comment(&mut self, text: &str, dst: &mut BytesMut) -> io::Result<()> {
        if text.contains(['\n', '\r']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "comment must be a single line",
            ));
        }
        writeln!(dst, ": {}", text).map_err(io::Error::other)?;
        dst.extend_from_slice(b"\n");
        Ok(())
    }

    fn mark_malformed(&mut self, reason: impl Into<String>) {
        if self.malformed.is_none() {
            self.malformed = Some(reason.into());
        }
    }

    fn process_line(&mut self, line: &[u8]) -> Option<SseFrame> {
        if line.is_empty() {
            return self.finish_frame();
        }

        let Ok(line) = std::str::from_utf8(line) else {
            self.mark_malformed("invalid UTF-8 in frame");
            return None;
        };

        if let Some(comment) = line.strip_prefix(':') {
            let text = comment.strip_prefix(' ').unwrap_or(comment);
            return Some(SseFrame::Comment(text.to_string()));
        }

        if self.malformed.is_some() {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                if self.pending.has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.pending.has_data = true;
            }
            "id" if value.is_empty() => self.pending.id = None,
            "id" => match value.parse::<EventId>() {
                Ok(id) => self.pending.id = Some(id),
                Err(_) => self.mark_malformed(format!("invalid event id: {}", value)),
            },
            "event" => self.pending.event = Some(value.to_string()),
            "retry" => {}
            other => trace!(field = other, "ignoring unknown event-stream field"),
        }

        None
    }

    fn finish_frame(&mut self) -> Option<SseFrame> {
        let pending = std::mem::take(&mut self.pending);
        if let Some(reason) = self.malformed.take() {
            return Some(SseFrame::Malformed(reason));
        }
        if !pending.has_data {
            return None;
        }
        Some(SseFrame::Event(SseEvent {
            id: pending.id,
            event: pending.event,
            data: pending.data,
        }))
    }
}

impl Decoder for SseCodec {
    type Item = SseFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<SseFrame>> {
        loop {
            let start = self.next_index.min(src.len());
            let Some(offset) = src[start..].iter().position(|b| *b == b'\n') else {
                if self.discarding_line {
                    src.clear();
                    self.next_index = 0;
                } else if src.len() > self.max_line_length {
                    src.clear();
                    self.next_index = 0;
                    self.discarding_line = true;
                    self.mark_malformed("line exceeds maximum length");
                } else {
                    self.next_index = src.len();
                }
                return Ok(None);
            };

            let end = start + offset;
            let raw = src.split_to(end + 1);
            self.next_index = 0;

            if self.discarding_line {
                self.discarding_line = false;
                continue;
            }
            if end > self.max_line_length {
                self.mark_malformed("line exceeds maximum length");
                continue;
            }

            let mut line = &raw[..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }

            if let Some(frame) = self.process_line(line) {
                return Ok(Some(frame));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<SseFrame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() || self.pending.has_data {
            trace!(
                buffered = src.len(),
                "discarding incomplete event at end of stream"
            );
        }
        src.clear();
        self.next_index = 0;
        self.discarding_line = false;
        self.malformed = None;
        self.pending = PendingEvent::default();
        Ok(None)
    }
}

impl Encoder<&SseEvent> for SseCodec {
    type Error = io::Error;

    fn encode(&mut self, event: &SseEvent, dst: &mut BytesMut) -> io::Result<()> {
        if event.data.contains('\r') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "event data must not contain carriage returns",
            ));
        }
        if let Some(id) = event.id {
            writeln!(dst, "id: {}", id).map_err(io::Error::other)?;
        }
        if let Some(kind) = &event.event {
            if kind.contains(['\n', '\r']) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "event type must be a single line",
                ));
            }
            writeln!(dst, "event: {}", kind).map_err(io::Error::other)?;
        }
        for line in event.data.split('\n') {
            writeln!(dst, "data: {}", line).map_err(io::Error::other)?;
        }
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

//! The duplex channel abstraction.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::{ChannelError, Result};

/// A bidirectional byte stream of newline-delimited JSON envelopes.
///
/// `write` takes exactly one envelope per call. `read` yields the inbound
/// bytes in order, each envelope followed by `\n`, and returns `Ok(0)` once
/// the channel was closed deliberately. A stream that dropped on its own
/// surfaces as [`ChannelError::ConnectionLost`] instead, after which
/// [`reconnect`](DuplexChannel::reconnect) may resume it.
///
/// No ordering is implied between the two directions.
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    /// Send one envelope. Returns the number of bytes accepted.
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Read inbound bytes into `buf`.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Close the channel. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;

    /// Resume a dropped inbound stream.
    async fn reconnect(&self) -> Result<()> {
        Err(ChannelError::ResumeUnsupported)
    }
}

/// Item handed from a reader task to the consumer.
#[derive(Debug)]
pub(crate) enum InboundItem {
    /// One envelope, already newline terminated.
    Data(Bytes),
    /// The stream dropped.
    Lost(String),
}

impl InboundItem {
    /// Wrap a payload, appending the line terminator.
    pub(crate) fn line(payload: &[u8]) -> Self {
        let mut line = BytesMut::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.extend_from_slice(b"\n");
        Self::Data(line.freeze())
    }
}

/// Consumer side of the inbound queue.
///
/// Holds bytes a previous `read` could not fit into the caller's buffer.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub(crate) rx: mpsc::UnboundedReceiver<InboundItem>,
    pending: BytesMut,
}

impl Inbound {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<InboundItem>) -> Self {
        Self {
            rx,
            pending: BytesMut::new(),
        }
    }

    /// Copy buffered bytes into `buf`, if there are any.
    pub(crate) fn drain_into(&mut self, buf: &mut [u8]) -> Option<usize> {
        if self.pending.is_empty() || buf.is_empty() {
            return None;
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Some(n)
    }

    pub(crate) fn buffer(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }
}

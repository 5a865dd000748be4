//! Push streams towards the client.

use std::sync::Weak;
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;

use crate::event_log::EventRecord;
use crate::session::Session;

/// One item on a push stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    /// A logged event.
    Event(EventRecord),
    /// Keepalive comment. Never logged and carries no event id.
    Keepalive,
}

/// The receiving end of a session's push channel.
///
/// Holds only a weak reference to its session. Dropping the stream detaches
/// it, unless another stream has replaced it in the meantime.
#[derive(Debug)]
pub struct PushStream {
    rx: mpsc::Receiver<PushFrame>,
    session: Weak<Session>,
    generation: u64,
}

impl PushStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<PushFrame>,
        session: Weak<Session>,
        generation: u64,
    ) -> Self {
        Self {
            rx,
            session,
            generation,
        }
    }

    /// Receive the next frame, or `None` once the stream was detached or
    /// the session closed.
    pub async fn recv(&mut self) -> Option<PushFrame> {
        self.rx.recv().await
    }

    /// Turn into a stream of frames with keepalives.
    ///
    /// A [`PushFrame::Keepalive`] is yielded whenever `keepalive` passes
    /// without any other frame.
    pub fn into_frames(mut self, keepalive: Duration) -> impl Stream<Item = PushFrame> + Send {
        async_stream::stream! {
            let sleep = tokio::time::sleep(keepalive);
            tokio::pin!(sleep);

            loop {
                let next = tokio::select! {
                    frame = self.rx.recv() => frame,
                    _ = &mut sleep => Some(PushFrame::Keepalive),
                };
                let Some(frame) = next else {
                    break;
                };
                if matches!(frame, PushFrame::Keepalive) {
                    if let Some(session) = self.session.upgrade() {
                        session.keepalive(self.generation);
                    }
                }
                sleep.as_mut().reset(tokio::time::Instant::now() + keepalive);
                yield frame;
            }
        }
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.detach(self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::SessionId;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Arc;
    use tether_protocol::{JsonRpcNotification, Message};

    fn session() -> Arc<Session> {
        Arc::new(Session::new(SessionId::generate(), &SessionConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_on_idle_stream() {
        let session = session();
        let frames = session
            .attach(None)
            .unwrap()
            .into_frames(Duration::from_secs(30));
        tokio::pin!(frames);

        assert_eq!(frames.next().await, Some(PushFrame::Keepalive));
        assert_eq!(frames.next().await, Some(PushFrame::Keepalive));

        // Keepalives never consume an event id.
        assert_eq!(session.last_event_id(), 0);
        session
            .push(&Message::Notification(JsonRpcNotification::new(
                "notifications/message",
                Some(json!({})),
            )))
            .unwrap();
        match frames.next().await {
            Some(PushFrame::Event(record)) => assert_eq!(record.id, 1),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_postpone_keepalive() {
        let session = session();
        let frames = session
            .attach(None)
            .unwrap()
            .into_frames(Duration::from_secs(30));
        tokio::pin!(frames);

        tokio::time::advance(Duration::from_secs(20)).await;
        session
            .push(&Message::Notification(JsonRpcNotification::new("a", None)))
            .unwrap();
        assert!(matches!(frames.next().await, Some(PushFrame::Event(_))));

        let before = tokio::time::Instant::now();
        assert_eq!(frames.next().await, Some(PushFrame::Keepalive));
        assert!(before.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_counts_as_activity() {
        let session = session();
        let frames = session
            .attach(None)
            .unwrap()
            .into_frames(Duration::from_secs(30));
        tokio::pin!(frames);

        for _ in 0..4 {
            assert_eq!(frames.next().await, Some(PushFrame::Keepalive));
            assert!(!session.is_idle(Duration::from_secs(45)));
        }
    }

    #[tokio::test]
    async fn test_stream_ends_when_session_closes() {
        let session = session();
        let frames = session
            .attach(None)
            .unwrap()
            .into_frames(Duration::from_secs(30));
        tokio::pin!(frames);

        session.close();
        assert_eq!(frames.next().await, None);
    }
}

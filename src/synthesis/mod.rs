//! Speech-synthesis bridge: text fragments in, transport-sized audio out.
//!
//! A synthesis stream is opened lazily, once per utterance, on the first
//! generated token. Fragments are forwarded with a generation-trigger
//! hint; the backend alone decides when it has enough text to start
//! producing audio. Returned audio segments are re-chunked into frames
//! sized for the rendering transport and forwarded in order.

pub mod stream_ws;

pub use stream_ws::StreamWsSynthesis;

use crate::error::Result;
use crate::registry::{SessionId, SessionRegistry};
use crate::relay::channel::ClientChannel;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A text fragment forwarded to an open synthesis stream.
///
/// An empty `text` is the final flush that forces completion of any
/// trailing audio.
#[derive(Debug, Clone)]
pub struct SynthesisFragment {
    /// Fragment text.
    pub text: String,
    /// Hint that the backend may start generating audio now.
    pub trigger_generation: bool,
}

/// Events emitted by a synthesis connection, in stream order.
#[derive(Debug, Clone)]
pub enum SynthesisEvent {
    /// One decoded audio segment, backend-sized.
    Audio(Bytes),
    /// The backend finished the stream.
    Final,
    /// The backend closed the stream without a final marker.
    Closed,
    /// The backend reported an error.
    Error(String),
}

/// One live streaming connection to a synthesis backend, already primed
/// with the session's synthesis parameters.
pub struct SynthesisConnection {
    /// Fragment sink. Dropping it stops further text.
    pub input: mpsc::UnboundedSender<SynthesisFragment>,
    /// Ordered event stream.
    pub events: mpsc::Receiver<SynthesisEvent>,
}

/// An injected synthesis service client.
#[async_trait]
pub trait SynthesisBackend: Send + Sync + 'static {
    /// Open one synthesis stream for a voice and send the priming
    /// message before any real text.
    async fn open(&self, voice_id: &str) -> Result<SynthesisConnection>;
}

/// Write half of a session's synthesis stream.
///
/// The stream is the ordering authority: all frames for fragment N are
/// delivered before any frame of fragment N+1, because audio flows back
/// on one ordered event stream consumed by one pump task.
#[derive(Debug)]
pub struct SynthesisBridge {
    input: mpsc::UnboundedSender<SynthesisFragment>,
}

impl SynthesisBridge {
    /// Open a synthesis stream and spawn the audio pump.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend stream cannot be opened.
    pub async fn open(
        backend: &dyn SynthesisBackend,
        voice_id: &str,
        channel: ClientChannel,
        registry: Arc<SessionRegistry>,
        session_id: SessionId,
        max_frame_bytes: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let conn = backend.open(voice_id).await?;
        tokio::spawn(pump_audio(
            conn.events,
            channel,
            registry,
            session_id,
            max_frame_bytes,
            cancel,
        ));
        Ok(Self { input: conn.input })
    }

    /// Forward a text fragment with the generation-trigger hint.
    pub fn send_fragment(&self, text: &str) {
        let _ = self.input.send(SynthesisFragment {
            text: text.to_owned(),
            trigger_generation: true,
        });
    }

    /// Send the final empty flush that forces trailing audio out.
    pub fn flush(&self) {
        let _ = self.input.send(SynthesisFragment {
            text: String::new(),
            trigger_generation: true,
        });
    }
}

async fn pump_audio(
    mut events: mpsc::Receiver<SynthesisEvent>,
    channel: ClientChannel,
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = events.recv() => match maybe {
                Some(SynthesisEvent::Audio(segment)) => {
                    for frame in rechunk(&segment, max_frame_bytes) {
                        // The session may have been destroyed while this
                        // segment was in flight; never write to a dead
                        // channel.
                        if !registry.live(&session_id) {
                            debug!("synthesis audio dropped; session {session_id} gone");
                            return;
                        }
                        if channel.send_audio(frame).is_err() {
                            return;
                        }
                    }
                }
                Some(SynthesisEvent::Final) => {
                    debug!("synthesis stream completed for session {session_id}");
                    return;
                }
                Some(SynthesisEvent::Error(e)) => {
                    warn!("synthesis backend error for session {session_id}: {e}");
                    return;
                }
                Some(SynthesisEvent::Closed) | None => return,
            },
        }
    }
}

/// Split a decoded audio segment into frames of at most
/// `max_frame_bytes`, preserving order and content.
pub(crate) fn rechunk(segment: &Bytes, max_frame_bytes: usize) -> Vec<Bytes> {
    let max = max_frame_bytes.max(1);
    let mut frames = Vec::with_capacity(segment.len().div_ceil(max));
    let mut offset = 0;
    while offset < segment.len() {
        let end = (offset + max).min(segment.len());
        frames.push(segment.slice(offset..end));
        offset = end;
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::channel::OutboundFrame;
    use tokio::time::{Duration, timeout};

    struct StubBackend {
        conn: std::sync::Mutex<Option<SynthesisConnection>>,
    }

    impl StubBackend {
        fn new() -> (
            Self,
            mpsc::UnboundedReceiver<SynthesisFragment>,
            mpsc::Sender<SynthesisEvent>,
        ) {
            let (input_tx, input_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::channel(16);
            let conn = SynthesisConnection {
                input: input_tx,
                events: event_rx,
            };
            (
                Self {
                    conn: std::sync::Mutex::new(Some(conn)),
                },
                input_rx,
                event_tx,
            )
        }
    }

    #[async_trait]
    impl SynthesisBackend for StubBackend {
        async fn open(&self, _voice_id: &str) -> Result<SynthesisConnection> {
            Ok(self.conn.lock().expect("lock").take().expect("single open"))
        }
    }

    #[test]
    fn rechunk_respects_limit_and_roundtrips() {
        let segment = Bytes::from((0..12_000u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
        let frames = rechunk(&segment, 5 * 1024);

        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() <= 5 * 1024));
        assert_eq!(frames[0].len(), 5 * 1024);
        assert_eq!(frames[1].len(), 5 * 1024);
        assert_eq!(frames[2].len(), 12_000 - 2 * 5 * 1024);

        let mut rebuilt = Vec::new();
        for frame in &frames {
            rebuilt.extend_from_slice(frame);
        }
        assert_eq!(Bytes::from(rebuilt), segment);
    }

    #[test]
    fn rechunk_of_empty_segment_is_empty() {
        assert!(rechunk(&Bytes::new(), 1024).is_empty());
    }

    #[tokio::test]
    async fn fragments_forward_in_order_with_trigger_hint() {
        let registry = Arc::new(SessionRegistry::new());
        let id = registry.create("p", "v");
        let (backend, mut input_rx, _events) = StubBackend::new();
        let (channel, _rx) = ClientChannel::new();

        let bridge = SynthesisBridge::open(
            &backend,
            "voice",
            channel,
            Arc::clone(&registry),
            id,
            5120,
            CancellationToken::new(),
        )
        .await
        .expect("open");

        bridge.send_fragment("Hello");
        bridge.send_fragment(" there");
        bridge.send_fragment("!");
        bridge.flush();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let fragment = timeout(Duration::from_secs(1), input_rx.recv())
                .await
                .expect("in time")
                .expect("fragment");
            assert!(fragment.trigger_generation);
            seen.push(fragment.text);
        }
        assert_eq!(seen, vec!["Hello", " there", "!", ""]);
    }

    #[tokio::test]
    async fn audio_segments_are_rechunked_in_order() {
        let registry = Arc::new(SessionRegistry::new());
        let id = registry.create("p", "v");
        let (backend, _input_rx, events) = StubBackend::new();
        let (channel, mut rx) = ClientChannel::new();

        let _bridge = SynthesisBridge::open(
            &backend,
            "voice",
            channel,
            Arc::clone(&registry),
            id,
            4,
            CancellationToken::new(),
        )
        .await
        .expect("open");

        events
            .send(SynthesisEvent::Audio(Bytes::from_static(b"abcdefgh")))
            .await
            .expect("event");
        events
            .send(SynthesisEvent::Audio(Bytes::from_static(b"ij")))
            .await
            .expect("event");
        events.send(SynthesisEvent::Final).await.expect("event");

        let mut rebuilt = Vec::new();
        for _ in 0..3 {
            match timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(OutboundFrame::Audio(frame))) => {
                    assert!(frame.len() <= 4);
                    rebuilt.extend_from_slice(&frame);
                }
                other => panic!("expected audio frame, got {other:?}"),
            }
        }
        assert_eq!(rebuilt, b"abcdefghij");
    }

    #[tokio::test]
    async fn destroyed_session_stops_frame_forwarding() {
        let registry = Arc::new(SessionRegistry::new());
        let id = registry.create("p", "v");
        let (backend, _input_rx, events) = StubBackend::new();
        let (channel, mut rx) = ClientChannel::new();

        let _bridge = SynthesisBridge::open(
            &backend,
            "voice",
            channel,
            Arc::clone(&registry),
            id.clone(),
            1024,
            CancellationToken::new(),
        )
        .await
        .expect("open");

        registry.destroy(&id);
        events
            .send(SynthesisEvent::Audio(Bytes::from_static(b"too late")))
            .await
            .expect("event");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }
}

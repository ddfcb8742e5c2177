//! Speech-recognition bridge: push audio in, utterances out.
//!
//! The bridge insulates the session socket from the recognition backend's
//! connection latency. Audio pushed while the connection is still being
//! established is held in a FIFO and flushed exactly once, in order, when
//! the backend opens. Transcript events flow through a single dispatch
//! point that classifies them and emits finished utterances to the
//! orchestrator.

pub mod live_ws;

pub use live_ws::LiveWsRecognition;

use crate::error::Result;
use crate::pipeline::messages::Utterance;
use crate::pipeline::orchestrator::OrchestratorHandle;
use crate::registry::{SessionId, SessionRegistry};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Input accepted by an open recognition connection.
#[derive(Debug, Clone)]
pub enum RecognitionInput {
    /// Raw microphone audio.
    Audio(Bytes),
    /// Protocol-level no-op so the backend keeps the stream alive.
    KeepAlive,
}

/// Events emitted by a recognition connection, in stream order.
#[derive(Debug, Clone)]
pub enum RecognitionEvent {
    /// A transcript fragment.
    Transcript {
        /// Recognized text; may be empty.
        text: String,
        /// Whether the fragment is finalized (vs. interim).
        is_final: bool,
        /// Whether the backend considers the speech turn complete.
        speech_final: bool,
    },
    /// The backend detected end of utterance (silence) without a
    /// closing transcript.
    UtteranceEnd,
    /// The backend closed the stream.
    Closed,
    /// The backend reported an error.
    Error(String),
}

/// One live streaming connection to a recognition backend.
pub struct RecognitionConnection {
    /// Audio/keepalive sink. Dropping it closes the stream.
    pub input: mpsc::Sender<RecognitionInput>,
    /// Ordered event stream.
    pub events: mpsc::Receiver<RecognitionEvent>,
}

/// An injected recognition service client.
#[async_trait]
pub trait RecognitionBackend: Send + Sync + 'static {
    /// Open one streaming recognition connection. Resolves once the
    /// stream is ready for audio.
    async fn connect(&self) -> Result<RecognitionConnection>;
}

/// Write half of a session's recognition bridge.
#[derive(Debug, Clone)]
pub struct RecognitionBridge {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl RecognitionBridge {
    /// Spawn the bridge task for one session.
    ///
    /// The task owns the backend connection lifecycle; at most one
    /// connection per session. Finished utterances are submitted to
    /// `utterances`.
    pub fn spawn(
        backend: Arc<dyn RecognitionBackend>,
        registry: Arc<SessionRegistry>,
        session_id: SessionId,
        utterances: OrchestratorHandle,
        keepalive_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_bridge(
            backend,
            registry,
            session_id,
            rx,
            utterances,
            keepalive_interval,
            cancel,
        ));
        Self { tx }
    }

    /// Push microphone audio. Never blocks: while the backend connection
    /// is still opening the bytes are buffered; once the bridge is
    /// degraded they are dropped.
    pub fn send(&self, bytes: Bytes) {
        // Receiver gone means the session is tearing down.
        let _ = self.tx.send(bytes);
    }
}

async fn run_bridge(
    backend: Arc<dyn RecognitionBackend>,
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    utterances: OrchestratorHandle,
    keepalive_interval: Duration,
    cancel: CancellationToken,
) {
    // Phase 1: buffer audio while the backend connection is established.
    let mut pending: Vec<Bytes> = Vec::new();
    let connect = backend.connect();
    tokio::pin!(connect);

    let mut conn = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok(conn) => break conn,
                Err(e) => {
                    warn!("recognition connect failed for session {session_id}: {e}");
                    drain_degraded(&mut rx, &cancel).await;
                    return;
                }
            },
            maybe = rx.recv() => match maybe {
                Some(bytes) => pending.push(bytes),
                // Socket closed before the backend ever opened.
                None => return,
            },
            _ = cancel.cancelled() => return,
        }
    };

    // Flush the queue exactly once, in send order, then forward directly.
    info!(
        "recognition backend open for session {session_id}; flushing {} buffered frames",
        pending.len()
    );
    for frame in pending.drain(..) {
        if conn.input.send(RecognitionInput::Audio(frame)).await.is_err() {
            warn!("recognition stream dropped during flush for session {session_id}");
            drain_degraded(&mut rx, &cancel).await;
            return;
        }
    }

    // Phase 2: direct forward, event dispatch, fixed-cadence keepalive.
    let mut fragments: Vec<String> = Vec::new();
    let mut keepalive = tokio::time::interval(keepalive_interval);
    // Skip the first immediate tick.
    keepalive.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = rx.recv() => match maybe {
                Some(bytes) => {
                    if conn.input.send(RecognitionInput::Audio(bytes)).await.is_err() {
                        warn!("recognition stream dropped for session {session_id}");
                        drain_degraded(&mut rx, &cancel).await;
                        return;
                    }
                }
                None => return,
            },
            maybe = conn.events.recv() => match maybe {
                Some(event) => {
                    if !on_backend_event(event, &mut fragments, &registry, &session_id, &utterances) {
                        drain_degraded(&mut rx, &cancel).await;
                        return;
                    }
                }
                None => {
                    debug!("recognition event stream ended for session {session_id}");
                    return;
                }
            },
            _ = keepalive.tick() => {
                let _ = conn.input.send(RecognitionInput::KeepAlive).await;
            }
        }
    }
}

/// Single dispatch point for backend events. Returns `false` when the
/// bridge must degrade.
fn on_backend_event(
    event: RecognitionEvent,
    fragments: &mut Vec<String>,
    registry: &SessionRegistry,
    session_id: &str,
    utterances: &OrchestratorHandle,
) -> bool {
    match event {
        RecognitionEvent::Transcript {
            text,
            is_final,
            speech_final,
        } => {
            if text.is_empty() {
                return true;
            }
            if !is_final {
                // Interim results are display-only and non-actionable.
                debug!("interim transcript for session {session_id}: {text}");
                return true;
            }
            fragments.push(text);
            if speech_final {
                emit_utterance(fragments, registry, session_id, utterances);
            }
            true
        }
        // The backend heard silence while finalized fragments were still
        // buffered: force the boundary so hesitant speech is not lost.
        RecognitionEvent::UtteranceEnd => {
            if !fragments.is_empty() {
                emit_utterance(fragments, registry, session_id, utterances);
            }
            true
        }
        RecognitionEvent::Closed => {
            debug!("recognition backend closed stream for session {session_id}");
            false
        }
        RecognitionEvent::Error(e) => {
            warn!("recognition backend error for session {session_id}: {e}");
            false
        }
    }
}

fn emit_utterance(
    fragments: &mut Vec<String>,
    registry: &SessionRegistry,
    session_id: &str,
    utterances: &OrchestratorHandle,
) {
    let utterance = Utterance::from_fragments(fragments);
    fragments.clear();
    if !registry.live(session_id) {
        debug!("utterance dropped; session {session_id} no longer exists");
        return;
    }
    info!("utterance for session {session_id}: {}", utterance.text);
    utterances.submit(utterance);
}

/// Fail-soft mode: the backend is gone but the session survives for
/// display-only use. Audio is consumed and dropped until teardown. No
/// automatic reconnect.
async fn drain_degraded(rx: &mut mpsc::UnboundedReceiver<Bytes>, cancel: &CancellationToken) {
    debug!("recognition bridge degraded; dropping further audio");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = rx.recv() => if maybe.is_none() { return },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UtteranceOverflow;
    use crate::pipeline::orchestrator;
    use tokio::sync::oneshot;
    use tokio::time::{Duration, timeout};

    /// Recognition backend whose open moment is controlled by the test.
    struct StubBackend {
        open: std::sync::Mutex<Option<oneshot::Receiver<()>>>,
        input_tx: std::sync::Mutex<Option<mpsc::Sender<RecognitionInput>>>,
        input_capture: std::sync::Mutex<Option<mpsc::Receiver<RecognitionInput>>>,
        event_tx: std::sync::Mutex<Option<mpsc::Sender<RecognitionEvent>>>,
        event_rx: std::sync::Mutex<Option<mpsc::Receiver<RecognitionEvent>>>,
        fail: bool,
    }

    impl StubBackend {
        fn new(open: oneshot::Receiver<()>) -> Self {
            let (input_tx, input_capture) = mpsc::channel(64);
            let (event_tx, event_rx) = mpsc::channel(64);
            Self {
                open: std::sync::Mutex::new(Some(open)),
                input_tx: std::sync::Mutex::new(Some(input_tx)),
                input_capture: std::sync::Mutex::new(Some(input_capture)),
                event_tx: std::sync::Mutex::new(Some(event_tx)),
                event_rx: std::sync::Mutex::new(Some(event_rx)),
                fail: false,
            }
        }

        fn failing() -> Self {
            let (open_tx, open) = oneshot::channel();
            open_tx.send(()).expect("signal");
            let mut stub = Self::new(open);
            stub.fail = true;
            stub
        }

        fn take_input(&self) -> mpsc::Receiver<RecognitionInput> {
            self.input_capture.lock().expect("lock").take().expect("input capture")
        }

        fn event_sender(&self) -> mpsc::Sender<RecognitionEvent> {
            self.event_tx.lock().expect("lock").clone().expect("event sender")
        }
    }

    #[async_trait]
    impl RecognitionBackend for StubBackend {
        async fn connect(&self) -> Result<RecognitionConnection> {
            let open = self.open.lock().expect("lock").take().expect("single connect");
            let _ = open.await;
            if self.fail {
                return Err(crate::error::RelayError::backend(
                    crate::error::Backend::Recognition,
                    "refused",
                ));
            }
            Ok(RecognitionConnection {
                input: self.input_tx.lock().expect("lock").take().expect("input"),
                events: self.event_rx.lock().expect("lock").take().expect("events"),
            })
        }
    }

    fn test_handle() -> (OrchestratorHandle, mpsc::Receiver<Utterance>) {
        orchestrator::intake(UtteranceOverflow::Queue, 8)
    }

    async fn next_audio(rx: &mut mpsc::Receiver<RecognitionInput>) -> Bytes {
        loop {
            match timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(RecognitionInput::Audio(bytes))) => return bytes,
                Ok(Some(RecognitionInput::KeepAlive)) => continue,
                other => panic!("expected audio, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn audio_sent_before_open_flushes_in_order() {
        let registry = Arc::new(SessionRegistry::new());
        let id = registry.create("p", "v");
        let (open_tx, open_rx) = oneshot::channel();
        let backend = Arc::new(StubBackend::new(open_rx));
        let mut input = backend.take_input();
        let (handle, _utterances) = test_handle();

        let bridge = RecognitionBridge::spawn(
            backend,
            Arc::clone(&registry),
            id,
            handle,
            Duration::from_secs(10),
            CancellationToken::new(),
        );

        bridge.send(Bytes::from_static(b"one"));
        bridge.send(Bytes::from_static(b"two"));
        bridge.send(Bytes::from_static(b"three"));
        // Nothing may reach the backend before it opens.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(input.try_recv().is_err());

        open_tx.send(()).expect("open");
        assert_eq!(next_audio(&mut input).await, Bytes::from_static(b"one"));
        assert_eq!(next_audio(&mut input).await, Bytes::from_static(b"two"));
        assert_eq!(next_audio(&mut input).await, Bytes::from_static(b"three"));

        // Direct forwarding after the flush.
        bridge.send(Bytes::from_static(b"four"));
        assert_eq!(next_audio(&mut input).await, Bytes::from_static(b"four"));
    }

    #[tokio::test]
    async fn boundary_joins_fragments_into_one_utterance() {
        let registry = Arc::new(SessionRegistry::new());
        let id = registry.create("p", "v");
        let (open_tx, open_rx) = oneshot::channel();
        let backend = Arc::new(StubBackend::new(open_rx));
        let events = backend.event_sender();
        let _input = backend.take_input();
        let (handle, mut utterances) = test_handle();

        let _bridge = RecognitionBridge::spawn(
            backend,
            Arc::clone(&registry),
            id,
            handle,
            Duration::from_secs(10),
            CancellationToken::new(),
        );
        open_tx.send(()).expect("open");

        for (text, is_final, speech_final) in [
            ("well", false, false), // interim: non-actionable
            ("hello", true, false),
            ("there", true, true),
        ] {
            events
                .send(RecognitionEvent::Transcript {
                    text: text.to_owned(),
                    is_final,
                    speech_final,
                })
                .await
                .expect("event");
        }

        let utterance = timeout(Duration::from_secs(1), utterances.recv())
            .await
            .expect("in time")
            .expect("utterance");
        assert_eq!(utterance.text, "hello there");
    }

    #[tokio::test]
    async fn utterance_end_forces_flush_of_buffered_fragments() {
        let registry = Arc::new(SessionRegistry::new());
        let id = registry.create("p", "v");
        let (open_tx, open_rx) = oneshot::channel();
        let backend = Arc::new(StubBackend::new(open_rx));
        let events = backend.event_sender();
        let _input = backend.take_input();
        let (handle, mut utterances) = test_handle();

        let _bridge = RecognitionBridge::spawn(
            backend,
            Arc::clone(&registry),
            id,
            handle,
            Duration::from_secs(10),
            CancellationToken::new(),
        );
        open_tx.send(()).expect("open");

        // Final fragment without a closing flag, then silence.
        events
            .send(RecognitionEvent::Transcript {
                text: "I was saying".to_owned(),
                is_final: true,
                speech_final: false,
            })
            .await
            .expect("event");
        events
            .send(RecognitionEvent::UtteranceEnd)
            .await
            .expect("event");

        let utterance = timeout(Duration::from_secs(1), utterances.recv())
            .await
            .expect("in time")
            .expect("utterance");
        assert_eq!(utterance.text, "I was saying");

        // A bare utterance-end with nothing buffered emits nothing.
        events
            .send(RecognitionEvent::UtteranceEnd)
            .await
            .expect("event");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(utterances.try_recv().is_err());
    }

    #[tokio::test]
    async fn backend_error_degrades_but_session_survives() {
        let registry = Arc::new(SessionRegistry::new());
        let id = registry.create("p", "v");
        let (open_tx, open_rx) = oneshot::channel();
        let backend = Arc::new(StubBackend::new(open_rx));
        let events = backend.event_sender();
        let mut input = backend.take_input();
        let (handle, mut utterances) = test_handle();

        let bridge = RecognitionBridge::spawn(
            backend,
            Arc::clone(&registry),
            id.clone(),
            handle,
            Duration::from_secs(10),
            CancellationToken::new(),
        );
        open_tx.send(()).expect("open");

        events
            .send(RecognitionEvent::Error("stream reset".to_owned()))
            .await
            .expect("event");
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Sends after degrade are dropped, not forwarded.
        bridge.send(Bytes::from_static(b"late"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(input.try_recv().is_err());

        // The bridge task is still alive (utterance sink not closed) and
        // the session still exists.
        assert!(utterances.try_recv().is_err());
        assert!(registry.live(&id));
    }

    #[tokio::test]
    async fn failed_connect_drops_buffered_audio_without_panicking() {
        let registry = Arc::new(SessionRegistry::new());
        let id = registry.create("p", "v");
        let backend = Arc::new(StubBackend::failing());
        let (handle, _utterances) = test_handle();

        let bridge = RecognitionBridge::spawn(
            backend,
            Arc::clone(&registry),
            id.clone(),
            handle,
            Duration::from_secs(10),
            CancellationToken::new(),
        );
        bridge.send(Bytes::from_static(b"never delivered"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.live(&id));
    }
}

//! Conversation orchestration: utterances in, token fan-out.
//!
//! One worker per session consumes utterances strictly in arrival order:
//! exactly one generation request is in flight at a time and token streams
//! are never interleaved. Each token is delivered to the viewer display
//! immediately and forwarded to the synthesis bridge, which is opened
//! lazily, exactly once per utterance, on the first generated text.

use crate::config::{OrchestratorConfig, UtteranceOverflow};
use crate::error::Result;
use crate::generation::GenerationBackend;
use crate::pipeline::messages::Utterance;
use crate::registry::{SessionId, SessionRegistry};
use crate::relay::channel::ClientChannel;
use crate::synthesis::{SynthesisBackend, SynthesisBridge};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Submission half of a session's orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Utterance>,
    busy: Arc<AtomicBool>,
    overflow: UtteranceOverflow,
}

impl OrchestratorHandle {
    /// Hand an utterance to the worker.
    ///
    /// While a generation is in flight the configured overflow policy
    /// applies: `Queue` holds it for in-order processing, `Drop`
    /// discards it. Either way the caller's transcript state is
    /// untouched.
    pub fn submit(&self, utterance: Utterance) {
        if self.overflow == UtteranceOverflow::Drop && self.busy.load(Ordering::Relaxed) {
            warn!("utterance dropped mid-generation: {}", utterance.text);
            return;
        }
        match self.tx.try_send(utterance) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(utterance)) => {
                warn!("utterance queue full; dropping: {}", utterance.text);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("utterance after orchestrator shutdown ignored");
            }
        }
    }
}

/// Build the handle/worker intake pair.
pub(crate) fn intake(
    overflow: UtteranceOverflow,
    max_pending: usize,
) -> (OrchestratorHandle, mpsc::Receiver<Utterance>) {
    // Capacity covers the in-flight utterance plus the pending backlog.
    let (tx, rx) = mpsc::channel(max_pending.max(1) + 1);
    (
        OrchestratorHandle {
            tx,
            busy: Arc::new(AtomicBool::new(false)),
            overflow,
        },
        rx,
    )
}

/// Per-session conversation driver.
pub struct ConversationOrchestrator;

impl ConversationOrchestrator {
    /// Spawn the worker for one session and return its submission
    /// handle.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        registry: Arc<SessionRegistry>,
        session_id: SessionId,
        persona: String,
        voice_id: String,
        generation: Arc<dyn GenerationBackend>,
        synthesis: Arc<dyn SynthesisBackend>,
        channel: ClientChannel,
        config: &OrchestratorConfig,
        max_frame_bytes: usize,
        cancel: CancellationToken,
    ) -> OrchestratorHandle {
        let (handle, rx) = intake(config.overflow, config.max_pending_utterances);
        let busy = Arc::clone(&handle.busy);
        tokio::spawn(run_worker(Worker {
            registry,
            session_id,
            persona,
            voice_id,
            generation,
            synthesis,
            channel,
            max_frame_bytes,
            cancel,
            rx,
            busy,
        }));
        handle
    }
}

struct Worker {
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
    persona: String,
    voice_id: String,
    generation: Arc<dyn GenerationBackend>,
    synthesis: Arc<dyn SynthesisBackend>,
    channel: ClientChannel,
    max_frame_bytes: usize,
    cancel: CancellationToken,
    rx: mpsc::Receiver<Utterance>,
    busy: Arc<AtomicBool>,
}

async fn run_worker(mut worker: Worker) {
    loop {
        let utterance = tokio::select! {
            _ = worker.cancel.cancelled() => return,
            maybe = worker.rx.recv() => match maybe {
                Some(utterance) => utterance,
                None => return,
            },
        };

        worker.busy.store(true, Ordering::Relaxed);
        let result = respond(&worker, &utterance).await;
        worker.busy.store(false, Ordering::Relaxed);

        if let Err(e) = result {
            // Generation failure degrades this turn only; the session
            // stays up for further utterances.
            warn!(
                "generation failed for session {}: {e}",
                worker.session_id
            );
        }
    }
}

/// Drive one utterance through generation, fanning tokens out to the
/// display channel and the synthesis bridge.
async fn respond(worker: &Worker, utterance: &Utterance) -> Result<()> {
    info!(
        "generating reply for session {}: {}",
        worker.session_id, utterance.text
    );
    let mut tokens = worker
        .generation
        .stream_reply(&worker.persona, &utterance.text)
        .await?;

    let mut accumulated = String::new();
    let mut bridge: Option<SynthesisBridge> = None;
    let mut synthesis_unavailable = false;

    loop {
        let chunk = tokio::select! {
            _ = worker.cancel.cancelled() => break,
            maybe = tokens.recv() => match maybe {
                Some(chunk) => chunk,
                None => break,
            },
        };

        // The session may have been destroyed while this token was in
        // flight.
        if !worker.registry.live(&worker.session_id) {
            debug!("token stream abandoned; session {} gone", worker.session_id);
            return Ok(());
        }

        accumulated.push_str(&chunk.text);
        if worker.channel.send_text(&chunk.text).is_err() {
            return Ok(());
        }

        // Open the synthesis stream lazily, exactly once per utterance,
        // on the first non-empty text.
        if bridge.is_none() && !synthesis_unavailable && !accumulated.is_empty() {
            match SynthesisBridge::open(
                worker.synthesis.as_ref(),
                &worker.voice_id,
                worker.channel.clone(),
                Arc::clone(&worker.registry),
                worker.session_id.clone(),
                worker.max_frame_bytes,
                worker.cancel.clone(),
            )
            .await
            {
                Ok(opened) => bridge = Some(opened),
                Err(e) => {
                    // Text keeps flowing to the display; only audio is
                    // lost for this utterance.
                    warn!(
                        "synthesis unavailable for session {}: {e}",
                        worker.session_id
                    );
                    synthesis_unavailable = true;
                }
            }
        }

        if let Some(bridge) = &bridge
            && !chunk.text.is_empty()
        {
            bridge.send_fragment(&chunk.text);
        }
    }

    if let Some(bridge) = bridge.take() {
        bridge.flush();
    }
    debug!(
        "reply complete for session {} ({} chars)",
        worker.session_id,
        accumulated.len()
    );
    Ok(())
}

//! Per-session socket loop.
//!
//! Inbound binary frames are raw microphone audio for the recognition
//! bridge; inbound text frames are ignored. Outbound frames come from the
//! pipeline through the [`ClientChannel`] queue. Whichever side closes
//! first, teardown runs exactly once via the registry.

use crate::config::RelayConfig;
use crate::pipeline::orchestrator::ConversationOrchestrator;
use crate::recognition::RecognitionBridge;
use crate::registry::{Session, SessionRegistry};
use crate::relay::Backends;
use crate::relay::channel::{ClientChannel, OutboundFrame};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub(crate) async fn run_session_socket(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    backends: Arc<Backends>,
    config: Arc<RelayConfig>,
) {
    let session_id = session.id.clone();
    let cancel = session.cancel_token();

    let (channel, mut outbound) = ClientChannel::new();
    if let Err(e) = session.attach_channel(channel.clone()) {
        debug!("socket refused: {e}");
        return;
    }
    info!("client connected for session {session_id}");

    let orchestrator = ConversationOrchestrator::spawn(
        Arc::clone(&registry),
        session_id.clone(),
        session.prompt.clone(),
        session.voice_id.clone(),
        Arc::clone(&backends.generation),
        Arc::clone(&backends.synthesis),
        channel.clone(),
        &config.orchestrator,
        config.synthesis.max_frame_bytes,
        cancel.clone(),
    );
    let recognition = RecognitionBridge::spawn(
        Arc::clone(&backends.recognition),
        Arc::clone(&registry),
        session_id.clone(),
        orchestrator,
        Duration::from_secs(config.recognition.keepalive_interval_s),
        cancel.clone(),
    );

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = stream.next() => match maybe {
                Some(Ok(Message::Binary(audio))) => recognition.send(audio),
                Some(Ok(Message::Text(text))) => {
                    debug!("ignoring inbound text frame for session {session_id}: {text}");
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("client disconnected from session {session_id}");
                    break;
                }
                Some(Ok(_)) => {} // ping/pong handled by the server
                Some(Err(e)) => {
                    debug!("socket error for session {session_id}: {e}");
                    break;
                }
            },
            maybe = outbound.recv() => match maybe {
                Some(OutboundFrame::Text(json)) => {
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Some(OutboundFrame::Audio(frame)) => {
                    if sink.send(Message::Binary(frame)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Full teardown exactly once, regardless of which side closed.
    registry.destroy(&session_id);
}

//! The per-session client channel.
//!
//! One bidirectional session socket multiplexes raw microphone audio
//! (binary, inbound), JSON text events (outbound), and raw synthesized
//! audio (binary, outbound). [`ClientChannel`] is the write half handed to
//! the pipeline stages; the socket task drains its queue in order.

use crate::error::{RelayError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A typed JSON event delivered on a text frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Incremental generated text for the viewer display.
    Text { content: String },
}

/// A frame queued for delivery on the session socket.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Serialized JSON event.
    Text(String),
    /// Raw synthesized audio.
    Audio(Bytes),
}

/// Ordered write half of the session socket.
///
/// Cheap to clone; all clones feed one queue drained by the socket task,
/// so frames from any one producer stay in send order.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl ClientChannel {
    /// Create a channel and the receive half for the socket task.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a `{"type":"text","content":...}` event.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the socket task is gone.
    pub fn send_text(&self, content: &str) -> Result<()> {
        let event = ClientEvent::Text {
            content: content.to_owned(),
        };
        let json = serde_json::to_string(&event)
            .map_err(|e| RelayError::Channel(format!("encode text event: {e}")))?;
        self.tx
            .send(OutboundFrame::Text(json))
            .map_err(|_| RelayError::Channel("client socket closed".to_owned()))
    }

    /// Queue a raw audio frame.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the socket task is gone.
    pub fn send_audio(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(OutboundFrame::Audio(frame))
            .map_err(|_| RelayError::Channel("client socket closed".to_owned()))
    }
}

//! WebSocket synthesis client for stream-input text-to-speech services.
//!
//! Protocol: the client opens `/v1/text-to-speech/{voice}/stream-input`,
//! sends one priming message carrying the voice settings and credentials,
//! then successive `{text, try_trigger_generation}` messages. The service
//! replies with `{audio:<base64>}` segments and a final `{isFinal:true}`.

use crate::config::SynthesisConfig;
use crate::error::{Backend, RelayError, Result};
use crate::synthesis::{SynthesisBackend, SynthesisConnection, SynthesisEvent, SynthesisFragment};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Buffer for decoded audio segments headed to the bridge pump.
const EVENT_CHANNEL_SIZE: usize = 32;

/// Priming message sent before any real text to warm the stream.
#[derive(Debug, Clone, Serialize)]
struct PrimingMessage {
    text: String,
    voice_settings: VoiceSettings,
    xi_api_key: String,
}

#[derive(Debug, Clone, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

/// A text fragment on the wire.
#[derive(Debug, Clone, Serialize)]
struct FragmentMessage {
    text: String,
    try_trigger_generation: bool,
}

/// Messages received from the service.
#[derive(Debug, Clone, Deserialize)]
struct ServiceMessage {
    /// Base64-encoded audio segment.
    #[serde(default)]
    audio: Option<String>,
    /// Set on the closing message of a stream.
    #[serde(default, rename = "isFinal")]
    is_final: Option<bool>,
}

/// Synthesis client for a stream-input WebSocket service.
pub struct StreamWsSynthesis {
    config: SynthesisConfig,
    api_key: String,
}

impl StreamWsSynthesis {
    /// Create a new client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no API key is configured.
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        Ok(Self {
            config: config.clone(),
            api_key,
        })
    }

    fn stream_url(&self, voice_id: &str) -> Result<url::Url> {
        let base = self.config.base_url.trim_end_matches('/');
        let raw = format!("{base}/v1/text-to-speech/{voice_id}/stream-input");
        let mut url = url::Url::parse(&raw)
            .map_err(|e| RelayError::Config(format!("synthesis url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("model_id", &self.config.model_id)
            .append_pair("output_format", &self.config.output_format);
        Ok(url)
    }

    fn priming_message(&self) -> PrimingMessage {
        PrimingMessage {
            // A single space: real text would start audible synthesis.
            text: " ".to_owned(),
            voice_settings: VoiceSettings {
                stability: self.config.stability,
                similarity_boost: self.config.similarity_boost,
            },
            xi_api_key: self.api_key.clone(),
        }
    }
}

#[async_trait]
impl SynthesisBackend for StreamWsSynthesis {
    async fn open(&self, voice_id: &str) -> Result<SynthesisConnection> {
        let url = self.stream_url(voice_id)?;
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::backend(Backend::Synthesis, format!("connect: {e}")))?;
        let (mut write, read) = ws.split();

        let primer = serde_json::to_string(&self.priming_message())
            .map_err(|e| RelayError::backend(Backend::Synthesis, format!("encode primer: {e}")))?;
        write
            .send(Message::Text(primer))
            .await
            .map_err(|e| RelayError::backend(Backend::Synthesis, format!("prime: {e}")))?;
        debug!("synthesis stream primed for voice {voice_id}");

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        tokio::spawn(pump(write, read, input_rx, event_tx));

        Ok(SynthesisConnection {
            input: input_tx,
            events: event_rx,
        })
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsSource = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

async fn pump(
    mut write: WsSink,
    mut read: WsSource,
    mut input_rx: mpsc::UnboundedReceiver<SynthesisFragment>,
    event_tx: mpsc::Sender<SynthesisEvent>,
) {
    // Keep reading after the input side is dropped: trailing audio is
    // still in flight until the service sends its final message.
    let mut input_open = true;
    loop {
        tokio::select! {
            maybe = input_rx.recv(), if input_open => match maybe {
                Some(fragment) => {
                    let message = FragmentMessage {
                        text: fragment.text,
                        try_trigger_generation: fragment.trigger_generation,
                    };
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("synthesis fragment encode failed: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(json)).await {
                        let _ = event_tx.send(SynthesisEvent::Error(format!("send: {e}"))).await;
                        return;
                    }
                }
                None => input_open = false,
            },
            maybe = read.next() => match maybe {
                Some(Ok(Message::Text(text))) => {
                    if !handle_service_message(&text, &event_tx).await {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = event_tx.send(SynthesisEvent::Closed).await;
                    return;
                }
                Some(Err(e)) => {
                    let _ = event_tx.send(SynthesisEvent::Error(format!("read: {e}"))).await;
                    return;
                }
                _ => {}
            },
        }
    }
}

/// Decode one service message into events. Returns `false` once the
/// stream is finished.
async fn handle_service_message(text: &str, event_tx: &mpsc::Sender<SynthesisEvent>) -> bool {
    let message: ServiceMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            // Malformed payloads are ignored; the stream continues.
            debug!("ignoring malformed synthesis message: {e}");
            return true;
        }
    };

    if let Some(encoded) = message.audio {
        match BASE64.decode(encoded.as_bytes()) {
            Ok(decoded) => {
                if event_tx
                    .send(SynthesisEvent::Audio(Bytes::from(decoded)))
                    .await
                    .is_err()
                {
                    return false;
                }
            }
            Err(e) => debug!("ignoring undecodable synthesis audio: {e}"),
        }
    }

    if message.is_final == Some(true) {
        let _ = event_tx.send(SynthesisEvent::Final).await;
        return false;
    }
    true
}

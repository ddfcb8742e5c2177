//! WebSocket client for live streaming speech-recognition services.
//!
//! Protocol: binary frames carry raw audio upstream; JSON text frames
//! come back as `{type:"Results", channel.alternatives[0].transcript,
//! is_final, speech_final}` or `{type:"UtteranceEnd"}`. A JSON
//! `{"type":"KeepAlive"}` no-op keeps the stream open between turns.

use crate::config::RecognitionConfig;
use crate::error::{Backend, RelayError, Result};
use crate::recognition::{
    RecognitionBackend, RecognitionConnection, RecognitionEvent, RecognitionInput,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::debug;

/// Buffer between the socket pump and the bridge dispatch loop.
const EVENT_CHANNEL_SIZE: usize = 64;
/// Buffer for outbound audio frames.
const INPUT_CHANNEL_SIZE: usize = 64;

/// Messages received from the service.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ServiceMessage {
    /// A transcript for the current audio window.
    Results {
        #[serde(default)]
        channel: ResultsChannel,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
    },
    /// Silence after speech; the turn is over even without a closing
    /// transcript.
    UtteranceEnd {},
    /// Informational; not part of transcription.
    Metadata {},
    /// Informational; not part of transcription.
    SpeechStarted {},
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResultsChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// Recognition client for a live streaming WebSocket service.
pub struct LiveWsRecognition {
    config: RecognitionConfig,
    api_key: String,
}

impl LiveWsRecognition {
    /// Create a new client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no API key is configured.
    pub fn new(config: &RecognitionConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        Ok(Self {
            config: config.clone(),
            api_key,
        })
    }

    fn stream_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.config.url)
            .map_err(|e| RelayError::Config(format!("recognition url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("model", &self.config.model)
            .append_pair("language", &self.config.language)
            .append_pair("smart_format", bool_str(self.config.smart_format))
            .append_pair("no_delay", "true")
            .append_pair("interim_results", bool_str(self.config.interim_results))
            .append_pair("endpointing", &self.config.endpointing_ms.to_string())
            .append_pair("utterance_end_ms", &self.config.utterance_end_ms.to_string());
        Ok(url)
    }
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

#[async_trait]
impl RecognitionBackend for LiveWsRecognition {
    async fn connect(&self) -> Result<RecognitionConnection> {
        let url = self.stream_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::backend(Backend::Recognition, format!("request: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|e| RelayError::backend(Backend::Recognition, format!("auth header: {e}")))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| RelayError::backend(Backend::Recognition, format!("connect: {e}")))?;

        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        tokio::spawn(pump(ws, input_rx, event_tx));

        Ok(RecognitionConnection {
            input: input_tx,
            events: event_rx,
        })
    }
}

async fn pump(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut input_rx: mpsc::Receiver<RecognitionInput>,
    event_tx: mpsc::Sender<RecognitionEvent>,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            maybe = input_rx.recv() => match maybe {
                Some(RecognitionInput::Audio(bytes)) => {
                    if let Err(e) = write.send(Message::Binary(bytes.to_vec())).await {
                        let _ = event_tx.send(RecognitionEvent::Error(format!("send: {e}"))).await;
                        return;
                    }
                }
                Some(RecognitionInput::KeepAlive) => {
                    let keepalive = r#"{"type":"KeepAlive"}"#.to_owned();
                    if let Err(e) = write.send(Message::Text(keepalive)).await {
                        let _ = event_tx.send(RecognitionEvent::Error(format!("keepalive: {e}"))).await;
                        return;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
            },
            maybe = read.next() => match maybe {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_service_message(&text)
                        && event_tx.send(event).await.is_err()
                    {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = event_tx.send(RecognitionEvent::Closed).await;
                    return;
                }
                Some(Err(e)) => {
                    let _ = event_tx.send(RecognitionEvent::Error(format!("read: {e}"))).await;
                    return;
                }
                _ => {}
            },
        }
    }
}

/// Map one service payload to a bridge event. Malformed or purely
/// informational payloads yield nothing; the stream continues.
fn parse_service_message(text: &str) -> Option<RecognitionEvent> {
    let message: ServiceMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("ignoring malformed recognition message: {e}");
            return None;
        }
    };

    match message {
        ServiceMessage::Results {
            channel,
            is_final,
            speech_final,
        } => {
            let text = channel
                .alternatives
                .first()
                .map(|a| a.transcript.clone())
                .unwrap_or_default();
            Some(RecognitionEvent::Transcript {
                text,
                is_final,
                speech_final,
            })
        }
        ServiceMessage::UtteranceEnd {} => Some(RecognitionEvent::UtteranceEnd),
        ServiceMessage::Metadata {} | ServiceMessage::SpeechStarted {} => None,
    }
}

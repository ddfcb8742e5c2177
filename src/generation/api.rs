//! OpenAI-compatible generation backend with SSE streaming.
//!
//! Works against any server implementing the chat-completions API. The
//! reply is requested as a stream so tokens can be fanned out to the
//! viewer display and the synthesis bridge as they are generated.

use crate::config::GenerationConfig;
use crate::error::{Backend, RelayError, Result};
use crate::generation::GenerationBackend;
use crate::pipeline::messages::TokenChunk;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffer between the SSE reader and the orchestrator's token loop.
const TOKEN_CHANNEL_SIZE: usize = 64;

/// Generation client for an OpenAI-compatible chat-completions API.
pub struct ApiGeneration {
    client: reqwest::Client,
    config: GenerationConfig,
    api_key: String,
}

impl ApiGeneration {
    /// Create a new client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no API key is configured.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        Ok(Self {
            client: reqwest::Client::new(),
            config: config.clone(),
            api_key,
        })
    }

    fn completions_url(&self) -> String {
        let base = self
            .config
            .api_url
            .strip_suffix("/v1")
            .unwrap_or(&self.config.api_url)
            .trim_end_matches('/');
        format!("{base}/v1/chat/completions")
    }
}

#[async_trait]
impl GenerationBackend for ApiGeneration {
    async fn stream_reply(
        &self,
        persona: &str,
        utterance: &str,
    ) -> Result<mpsc::Receiver<TokenChunk>> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "assistant", "content": persona },
                { "role": "user", "content": utterance },
            ],
            "stream": true,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "max_tokens": self.config.max_tokens,
        });

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::backend(Backend::Generation, format!("request: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(RelayError::backend(
                Backend::Generation,
                format!("status {status}: {}", detail.chars().take(200).collect::<String>()),
            ));
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_SIZE);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut lines = SseLineBuffer::default();
            'outer: while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("generation stream read error: {e}");
                        break;
                    }
                };
                for line in lines.push(&chunk) {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    match parse_delta(data) {
                        Ok(Some(text)) => {
                            if tx.send(TokenChunk { text }).await.is_err() {
                                // Receiver gone: caller terminated the stream.
                                break 'outer;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => debug!("{e}"),
                    }
                    if finished(data) {
                        break 'outer;
                    }
                }
            }
            // Dropping `tx` ends the token stream for the consumer.
        });

        Ok(rx)
    }
}

/// Extract the delta content from one SSE data payload. `Ok(None)` for
/// empty deltas (role prelude, usage frames).
fn parse_delta(data: &str) -> Result<Option<String>> {
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| RelayError::malformed(Backend::Generation, format!("{e}: {data}")))?;
    let content = value["choices"][0]["delta"]["content"]
        .as_str()
        .unwrap_or_default();
    if content.is_empty() {
        Ok(None)
    } else {
        Ok(Some(content.to_owned()))
    }
}

fn finished(data: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(data)
        .map(|v| v["choices"][0]["finish_reason"].as_str() == Some("stop"))
        .unwrap_or(false)
}

/// Reassembles SSE lines from arbitrarily split byte chunks.
#[derive(Debug, Default)]
struct SseLineBuffer {
    carry: String,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.carry.find('\n') {
            let rest = self.carry.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.carry, rest);
            line.truncate(line.len() - 1);
            if line.ends_with('\r') {
                line.truncate(line.len() - 1);
            }
            lines.push(line);
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn sse_buffer_reassembles_split_lines() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        let lines = buffer.push(b":1}\ndata: [DO");
        assert_eq!(lines, vec!["data: {\"a\":1}".to_owned()]);
        let lines = buffer.push(b"NE]\n");
        assert_eq!(lines, vec!["data: [DONE]".to_owned()]);
    }

    #[test]
    fn sse_buffer_strips_carriage_returns() {
        let mut buffer = SseLineBuffer::default();
        let lines = buffer.push(b"data: x\r\n\r\n");
        assert_eq!(lines, vec!["data: x".to_owned(), String::new()]);
    }

    #[test]
    fn parse_delta_extracts_content() {
        let data = r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        assert_eq!(parse_delta(data).expect("parse"), Some("Hello".to_owned()));

        let prelude = r#"{"choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#;
        assert_eq!(parse_delta(prelude).expect("parse"), None);

        assert!(parse_delta("not json").is_err());
    }

    #[test]
    fn finish_reason_stop_detected() {
        assert!(finished(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#));
        assert!(!finished(r#"{"choices":[{"delta":{},"finish_reason":null}]}"#));
    }

    #[test]
    fn completions_url_tolerates_v1_suffix() {
        for api_url in [
            "https://api.example.com/openai/v1",
            "https://api.example.com/openai/",
        ] {
            let config = GenerationConfig {
                api_key: Some("k".to_owned()),
                api_url: api_url.to_owned(),
                ..GenerationConfig::default()
            };
            let backend = ApiGeneration::new(&config).expect("new");
            assert_eq!(
                backend.completions_url(),
                "https://api.example.com/openai/v1/chat/completions"
            );
        }
    }

    #[tokio::test]
    async fn stream_reply_yields_tokens_in_order() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"!\"},\"finish_reason\":null}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let config = GenerationConfig {
            api_url: server.uri(),
            api_key: Some("test-key".to_owned()),
            ..GenerationConfig::default()
        };
        let backend = ApiGeneration::new(&config).expect("new");

        let mut rx = backend
            .stream_reply("You are Einstein", "hello")
            .await
            .expect("stream");
        let mut tokens = Vec::new();
        while let Some(chunk) = rx.recv().await {
            tokens.push(chunk.text);
        }
        assert_eq!(tokens, vec!["Hello", " there", "!"]);
    }

    #[tokio::test]
    async fn backend_error_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let config = GenerationConfig {
            api_url: server.uri(),
            api_key: Some("test-key".to_owned()),
            ..GenerationConfig::default()
        };
        let backend = ApiGeneration::new(&config).expect("new");

        let result = backend.stream_reply("p", "u").await;
        assert!(matches!(
            result,
            Err(RelayError::BackendUnavailable {
                backend: Backend::Generation,
                ..
            })
        ));
    }
}

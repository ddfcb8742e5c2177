//! Configuration types for the avatar relay.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for the relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// HTTP/WebSocket server settings.
    pub server: ServerConfig,
    /// Speech-recognition backend settings.
    pub recognition: RecognitionConfig,
    /// Language-generation backend settings.
    pub generation: GenerationConfig,
    /// Speech-synthesis backend settings.
    pub synthesis: SynthesisConfig,
    /// Avatar rendering transport settings.
    pub transport: TransportConfig,
    /// Per-session orchestration settings.
    pub orchestrator: OrchestratorConfig,
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing sections and fields fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| RelayError::Config(format!("parse {}: {e}", path.display())))
    }
}

/// Relay server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8080,
        }
    }
}

/// Speech-recognition backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// WebSocket endpoint of the streaming recognition service.
    pub url: String,
    /// API key. Falls back to `GOLEM_RECOGNITION_API_KEY` when unset.
    pub api_key: Option<String>,
    /// Recognition model identifier.
    pub model: String,
    /// Spoken language hint.
    pub language: String,
    /// Apply backend-side punctuation/formatting to transcripts.
    pub smart_format: bool,
    /// Request interim (non-final) transcript events.
    pub interim_results: bool,
    /// Silence duration in ms after which the backend finalizes a segment.
    pub endpointing_ms: u32,
    /// Silence duration in ms after which the backend signals utterance end.
    pub utterance_end_ms: u32,
    /// Interval in seconds between no-op keepalives to the backend.
    pub keepalive_interval_s: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.deepgram.com/v1/listen".to_owned(),
            api_key: None,
            model: "nova-2".to_owned(),
            language: "en".to_owned(),
            smart_format: true,
            interim_results: true,
            endpointing_ms: 300,
            utterance_end_ms: 1000,
            keepalive_interval_s: 10,
        }
    }
}

impl RecognitionConfig {
    /// Resolve the API key from config or environment.
    ///
    /// # Errors
    ///
    /// Returns a config error if neither source provides a key.
    pub fn resolve_api_key(&self) -> Result<String> {
        resolve_key(self.api_key.as_deref(), "GOLEM_RECOGNITION_API_KEY")
    }
}

/// Language-generation backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Base URL of an OpenAI-compatible chat-completions API.
    pub api_url: String,
    /// API key. Falls back to `GOLEM_GENERATION_API_KEY` when unset.
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling threshold.
    pub top_p: f32,
    /// Maximum tokens per reply. Short by design; replies are spoken.
    pub max_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.groq.com/openai".to_owned(),
            api_key: None,
            model: "llama3-8b-8192".to_owned(),
            temperature: 1.0,
            top_p: 1.0,
            max_tokens: 50,
        }
    }
}

impl GenerationConfig {
    /// Resolve the API key from config or environment.
    ///
    /// # Errors
    ///
    /// Returns a config error if neither source provides a key.
    pub fn resolve_api_key(&self) -> Result<String> {
        resolve_key(self.api_key.as_deref(), "GOLEM_GENERATION_API_KEY")
    }
}

/// Speech-synthesis backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Base URL of the streaming synthesis service.
    pub base_url: String,
    /// API key. Falls back to `GOLEM_SYNTHESIS_API_KEY` when unset.
    pub api_key: Option<String>,
    /// Synthesis model identifier.
    pub model_id: String,
    /// Audio output format requested from the backend.
    pub output_format: String,
    /// Voice stability (0.0-1.0).
    pub stability: f32,
    /// Voice similarity boost (0.0-1.0).
    pub similarity_boost: f32,
    /// Maximum bytes per audio frame forwarded to the client channel.
    ///
    /// Must not exceed the rendering transport's per-message limit.
    pub max_frame_bytes: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            base_url: "wss://api.elevenlabs.io".to_owned(),
            api_key: None,
            model_id: "eleven_turbo_v2_5".to_owned(),
            output_format: "pcm_16000".to_owned(),
            stability: 0.5,
            similarity_boost: 0.5,
            max_frame_bytes: 5 * 1024,
        }
    }
}

impl SynthesisConfig {
    /// Resolve the API key from config or environment.
    ///
    /// # Errors
    ///
    /// Returns a config error if neither source provides a key.
    pub fn resolve_api_key(&self) -> Result<String> {
        resolve_key(self.api_key.as_deref(), "GOLEM_SYNTHESIS_API_KEY")
    }
}

/// Avatar rendering transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// STUN servers for ICE candidate gathering.
    pub stun_urls: Vec<String>,
    /// HTTP endpoint for the offer/answer exchange.
    pub offer_url: String,
    /// HTTP endpoint that creates a render session and returns its token.
    pub session_url: String,
    /// API key sent in the render-session handshake. Falls back to
    /// `GOLEM_RENDER_API_KEY` when unset.
    pub api_key: Option<String>,
    /// Interval in ms between ICE candidate-count samples.
    pub ice_poll_interval_ms: u64,
    /// Upper bound in ms on the ICE gathering wait.
    pub ice_max_wait_ms: u64,
    /// Interval in ms between keepalive pings on the open data channel.
    pub keepalive_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec!["stun:stun.l.google.com:19302".to_owned()],
            offer_url: "https://api.simli.ai/StartWebRTCSession".to_owned(),
            session_url: "https://api.simli.ai/startAudioToVideoSession".to_owned(),
            api_key: None,
            ice_poll_interval_ms: 250,
            ice_max_wait_ms: 5_000,
            keepalive_interval_ms: 1_000,
        }
    }
}

impl TransportConfig {
    /// Resolve the API key from config or environment.
    ///
    /// # Errors
    ///
    /// Returns a config error if neither source provides a key.
    pub fn resolve_api_key(&self) -> Result<String> {
        resolve_key(self.api_key.as_deref(), "GOLEM_RENDER_API_KEY")
    }
}

/// What to do with an utterance that arrives while a generation is
/// already in flight for the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtteranceOverflow {
    /// Queue it; process strictly in arrival order once the current
    /// generation finishes.
    #[default]
    Queue,
    /// Drop it with a warning.
    Drop,
}

/// Per-session orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Overflow behavior for utterances arriving mid-generation.
    pub overflow: UtteranceOverflow,
    /// Maximum utterances held while one is in flight (Queue mode).
    pub max_pending_utterances: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            overflow: UtteranceOverflow::Queue,
            max_pending_utterances: 8,
        }
    }
}

fn resolve_key(configured: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = configured
        && !key.trim().is_empty()
    {
        return Ok(key.trim().to_owned());
    }
    match std::env::var(env_var) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_owned()),
        _ => Err(RelayError::Config(format!(
            "no API key configured and {env_var} is unset"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_live_service_tuning() {
        let config = RelayConfig::default();
        assert_eq!(config.recognition.endpointing_ms, 300);
        assert_eq!(config.recognition.utterance_end_ms, 1000);
        assert_eq!(config.recognition.keepalive_interval_s, 10);
        assert_eq!(config.synthesis.max_frame_bytes, 5 * 1024);
        assert_eq!(config.generation.max_tokens, 50);
        assert_eq!(config.orchestrator.overflow, UtteranceOverflow::Queue);
    }

    #[test]
    fn toml_roundtrip_preserves_fields() {
        let mut config = RelayConfig::default();
        config.server.port = 9123;
        config.synthesis.max_frame_bytes = 2048;
        config.orchestrator.overflow = UtteranceOverflow::Drop;

        let raw = toml::to_string(&config).expect("serialize");
        let parsed: RelayConfig = toml::from_str(&raw).expect("parse");
        assert_eq!(parsed.server.port, 9123);
        assert_eq!(parsed.synthesis.max_frame_bytes, 2048);
        assert_eq!(parsed.orchestrator.overflow, UtteranceOverflow::Drop);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: RelayConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            "#,
        )
        .expect("parse");
        assert_eq!(parsed.server.port, 9000);
        assert_eq!(parsed.server.host, "127.0.0.1");
        assert_eq!(parsed.recognition.model, "nova-2");
    }

    #[test]
    fn load_reads_file_and_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay.toml");

        std::fs::write(&path, "[generation]\nmax_tokens = 128\n").expect("write");
        let config = RelayConfig::load(&path).expect("load");
        assert_eq!(config.generation.max_tokens, 128);

        std::fs::write(&path, "not toml at all [").expect("write");
        assert!(RelayConfig::load(&path).is_err());
    }

    #[test]
    fn resolve_key_prefers_config_over_env() {
        let resolved = resolve_key(Some("  abc  "), "GOLEM_TEST_KEY_UNSET").expect("resolve");
        assert_eq!(resolved, "abc");
        assert!(resolve_key(None, "GOLEM_TEST_KEY_UNSET").is_err());
        assert!(resolve_key(Some("   "), "GOLEM_TEST_KEY_UNSET").is_err());
    }
}

//! Golem: real-time voice-driven conversational avatar relay.
//!
//! One session socket per viewer feeds a cascaded streaming pipeline:
//! Microphone audio → recognition → generation → synthesis → avatar
//!
//! # Architecture
//!
//! Each session runs an independent pipeline built from actor tasks
//! connected by async channels:
//! - **ClientChannel**: the bidirectional session socket (axum)
//! - **SpeechRecognitionBridge**: buffers and streams audio to the
//!   recognition backend, emits finished utterances
//! - **ConversationOrchestrator**: drives one generation request at a
//!   time, fanning tokens out to the display and synthesis
//! - **SpeechSynthesisBridge**: streams text fragments out, re-chunks
//!   returned audio for the transport
//! - **MediaTransport**: WebRTC peer connection + data channel to the
//!   avatar rendering service
//!
//! Sessions touch each other only through the [`registry::SessionRegistry`].

pub mod config;
pub mod error;
pub mod generation;
pub mod pipeline;
pub mod recognition;
pub mod registry;
pub mod relay;
pub mod synthesis;
pub mod transport;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use registry::SessionRegistry;
pub use relay::{Backends, RelayServer};
pub use transport::{MediaTransport, TransportState};

//! Language generation: one persona-plus-utterance exchange, streamed.

pub mod api;

pub use api::ApiGeneration;

use crate::error::Result;
use crate::pipeline::messages::TokenChunk;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// An injected language-generation service client.
#[async_trait]
pub trait GenerationBackend: Send + Sync + 'static {
    /// Start one incremental token stream for a persona instruction plus
    /// a user utterance. The channel closes when generation completes;
    /// dropping the receiver terminates the request.
    async fn stream_reply(
        &self,
        persona: &str,
        utterance: &str,
    ) -> Result<mpsc::Receiver<TokenChunk>>;
}

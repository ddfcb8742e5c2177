//! Message types passed between pipeline stages.

use std::time::Instant;

/// One finalized speech turn, joined from recognized transcript fragments.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// The full utterance text.
    pub text: String,
    /// When the boundary that closed this utterance was recognized.
    pub recognized_at: Instant,
}

impl Utterance {
    /// Join finalized transcript fragments into one utterance.
    pub fn from_fragments(fragments: &[String]) -> Self {
        Self {
            text: fragments.join(" "),
            recognized_at: Instant::now(),
        }
    }
}

/// A single text fragment emitted by the generation stream.
///
/// Chunks must reach the viewer display and the synthesis bridge in
/// generation order.
#[derive(Debug, Clone)]
pub struct TokenChunk {
    /// The decoded text fragment.
    pub text: String,
}

//! Error types for the relay pipeline.

use crate::transport::TransportState;

/// Names the external service a backend error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Streaming speech-recognition service.
    Recognition,
    /// Language-generation service.
    Generation,
    /// Speech-synthesis service.
    Synthesis,
    /// Avatar rendering service (signaling + media).
    Rendering,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Recognition => "recognition",
            Self::Generation => "generation",
            Self::Synthesis => "synthesis",
            Self::Rendering => "rendering",
        };
        f.write_str(name)
    }
}

/// Top-level error type for the avatar relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Unknown or missing session id at the socket upgrade boundary.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// A backend is unreachable or erroring. Degrades one bridge only;
    /// the session survives.
    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable { backend: Backend, reason: String },

    /// Audio forwarding was attempted before the data channel is open.
    #[error("transport not ready (state: {0})")]
    TransportNotReady(TransportState),

    /// A backend payload had an unexpected shape. Logged and ignored by
    /// stream pumps; the stream continues.
    #[error("malformed {backend} message: {reason}")]
    MalformedMessage { backend: Backend, reason: String },

    /// Offer/answer or render-session signaling error.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error (receiver side gone).
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Shorthand for a [`RelayError::BackendUnavailable`].
    pub fn backend(backend: Backend, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend,
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`RelayError::MalformedMessage`].
    pub fn malformed(backend: Backend, reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            backend,
            reason: reason.into(),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, RelayError>;

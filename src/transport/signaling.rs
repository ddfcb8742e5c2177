//! Signaling client for the avatar rendering service.
//!
//! Two HTTP exchanges: the session-description offer/answer swap that
//! negotiates the peer connection, and render-session creation, whose
//! token becomes the one-time initialization handshake on the data
//! channel.

use crate::config::TransportConfig;
use crate::error::{Backend, RelayError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A local session-description offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOffer {
    /// SDP body.
    pub sdp: String,
    /// Description type (`offer`).
    #[serde(rename = "type")]
    pub kind: String,
}

/// The remote session-description answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAnswer {
    /// SDP body.
    pub sdp: String,
    /// Description type (`answer`).
    #[serde(rename = "type")]
    pub kind: String,
}

/// Parameters for creating a render session.
#[derive(Debug, Clone, Serialize)]
pub struct RenderSessionInit {
    /// Persona/face identifier to animate.
    #[serde(rename = "faceId")]
    pub face_id: String,
    /// Request an encoded video stream rather than JPEG frames.
    #[serde(rename = "isJPG")]
    pub is_jpg: bool,
    /// Rendering service credential.
    #[serde(rename = "apiKey")]
    pub api_key: String,
    /// Keep rendered video in sync with the forwarded audio.
    #[serde(rename = "syncAudio")]
    pub sync_audio: bool,
    /// Let the service idle-animate through silent stretches.
    #[serde(rename = "handleSilence")]
    pub handle_silence: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RenderSessionResponse {
    session_token: String,
}

#[derive(Debug, Clone, Serialize)]
struct OfferRequest<'a> {
    sdp: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    video_transform: &'a str,
}

/// An injected rendering-service signaling client.
#[async_trait]
pub trait SignalingClient: Send + Sync + 'static {
    /// Exchange the local offer for the service's answer.
    async fn exchange_offer(&self, offer: &SessionOffer) -> Result<SessionAnswer>;

    /// Create a render session; the returned token is sent as the
    /// data-channel handshake.
    async fn create_render_session(&self, init: &RenderSessionInit) -> Result<String>;
}

/// HTTP signaling client.
pub struct HttpSignalingClient {
    client: reqwest::Client,
    offer_url: String,
    session_url: String,
}

impl HttpSignalingClient {
    /// Create a client from transport configuration.
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            offer_url: config.offer_url.clone(),
            session_url: config.session_url.clone(),
        }
    }
}

#[async_trait]
impl SignalingClient for HttpSignalingClient {
    async fn exchange_offer(&self, offer: &SessionOffer) -> Result<SessionAnswer> {
        let request = OfferRequest {
            sdp: &offer.sdp,
            kind: &offer.kind,
            video_transform: "none",
        };
        let response = self
            .client
            .post(&self.offer_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RelayError::Signaling(format!("offer exchange: {e}")))?;
        if !response.status().is_success() {
            return Err(RelayError::Signaling(format!(
                "offer exchange status {}",
                response.status()
            )));
        }
        response
            .json::<SessionAnswer>()
            .await
            .map_err(|e| RelayError::malformed(Backend::Rendering, format!("answer: {e}")))
    }

    async fn create_render_session(&self, init: &RenderSessionInit) -> Result<String> {
        let response = self
            .client
            .post(&self.session_url)
            .json(init)
            .send()
            .await
            .map_err(|e| RelayError::Signaling(format!("render session: {e}")))?;
        if !response.status().is_success() {
            return Err(RelayError::Signaling(format!(
                "render session status {}",
                response.status()
            )));
        }
        let body = response
            .json::<RenderSessionResponse>()
            .await
            .map_err(|e| RelayError::malformed(Backend::Rendering, format!("session token: {e}")))?;
        Ok(body.session_token)
    }
}

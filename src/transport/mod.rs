//! Media transport to the avatar rendering service.
//!
//! One peer connection and one reliable ordered data channel per
//! session. The connection lifecycle is an explicit state machine,
//! observable through a watch channel; downstream code queries it
//! rather than inferring readiness from connection internals. Rendered
//! audio/video arrives on remote tracks; synthesized audio goes out on
//! the data channel, which also carries the one-time initialization
//! handshake and keepalive pings.

pub mod signaling;

pub use signaling::{HttpSignalingClient, RenderSessionInit, SessionOffer, SignalingClient};

use crate::config::TransportConfig;
use crate::error::{Backend, RelayError, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

/// Connection lifecycle of the rendering transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Nothing started yet.
    New,
    /// Local offer created; ICE candidates are being gathered.
    GatheringIce,
    /// Offer sent to the rendering service; applying the answer and
    /// waiting for the data channel handshake to be acknowledged.
    Negotiating,
    /// Handshake acknowledged; audio forwarding is accepted.
    Connected,
    /// Torn down.
    Closed,
    /// Negotiation failed.
    Failed,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::GatheringIce => "gathering-ice",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Buffer for remote track arrivals.
const TRACK_CHANNEL_SIZE: usize = 4;

/// State shared with connection callbacks.
struct Shared {
    state_tx: watch::Sender<TransportState>,
    acked: AtomicBool,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn set_state(&self, state: TransportState) {
        let _ = self.state_tx.send(state);
    }
}

/// Peer transport delivering rendered avatar media for one session.
pub struct MediaTransport {
    config: TransportConfig,
    signaling: Arc<dyn SignalingClient>,
    face_id: String,
    api_key: String,
    shared: Arc<Shared>,
    candidate_count: Arc<AtomicUsize>,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    dc: Mutex<Option<Arc<RTCDataChannel>>>,
    tracks: Mutex<Option<mpsc::Receiver<Arc<TrackRemote>>>>,
    track_tx: mpsc::Sender<Arc<TrackRemote>>,
}

impl MediaTransport {
    /// Create a transport in the `New` state. No network activity until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns an error if no rendering API key is configured.
    pub fn new(
        config: &TransportConfig,
        signaling: Arc<dyn SignalingClient>,
        face_id: &str,
    ) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let (state_tx, _) = watch::channel(TransportState::New);
        let (track_tx, track_rx) = mpsc::channel(TRACK_CHANNEL_SIZE);
        Ok(Self {
            config: config.clone(),
            signaling,
            face_id: face_id.to_owned(),
            api_key,
            shared: Arc::new(Shared {
                state_tx,
                acked: AtomicBool::new(false),
                keepalive: Mutex::new(None),
            }),
            candidate_count: Arc::new(AtomicUsize::new(0)),
            pc: Mutex::new(None),
            dc: Mutex::new(None),
            tracks: Mutex::new(Some(track_rx)),
            track_tx,
        })
    }

    /// Current connection state.
    pub fn state(&self) -> TransportState {
        *self.shared.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.shared.state_tx.subscribe()
    }

    /// Take the remote-track stream. Rendered audio/video tracks arrive
    /// here once the connection is up. Returns `None` after the first
    /// call.
    pub fn remote_tracks(&self) -> Option<mpsc::Receiver<Arc<TrackRemote>>> {
        lock(&self.tracks).take()
    }

    /// Negotiate the connection: gather ICE bounded by the stall poll,
    /// exchange the offer, apply the answer, then wait for the
    /// data-channel handshake acknowledgment before reporting
    /// `Connected`.
    ///
    /// # Errors
    ///
    /// Returns an error (and enters `Failed`) if any negotiation step
    /// fails. Calling it in any state but `New` is an error.
    pub async fn start(&self) -> Result<()> {
        if self.state() != TransportState::New {
            return Err(RelayError::TransportNotReady(self.state()));
        }
        match self.negotiate().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.set_state(TransportState::Failed);
                Err(e)
            }
        }
    }

    async fn negotiate(&self) -> Result<()> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| RelayError::backend(Backend::Rendering, format!("codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| RelayError::backend(Backend::Rendering, format!("interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.stun_urls.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| RelayError::backend(Backend::Rendering, format!("peer: {e}")))?,
        );

        // Count gathered candidates for the stall poll.
        let count = Arc::clone(&self.candidate_count);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let count = Arc::clone(&count);
            Box::pin(async move {
                if candidate.is_some() {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            })
        }));

        // Surface rendered media to the embedder.
        let track_tx = self.track_tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let track_tx = track_tx.clone();
            Box::pin(async move {
                debug!("remote {} track arrived", track.kind());
                let _ = track_tx.send(track).await;
            })
        }));

        // Local media endpoints for the rendered downstream.
        pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .map_err(|e| RelayError::backend(Backend::Rendering, format!("audio transceiver: {e}")))?;
        pc.add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .map_err(|e| RelayError::backend(Backend::Rendering, format!("video transceiver: {e}")))?;

        // One reliable ordered channel for handshake, keepalive and audio.
        let dc = pc
            .create_data_channel(
                "chat",
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| RelayError::backend(Backend::Rendering, format!("data channel: {e}")))?;
        self.install_channel_callbacks(&dc);

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| RelayError::backend(Backend::Rendering, format!("offer: {e}")))?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .map_err(|e| RelayError::backend(Backend::Rendering, format!("local sdp: {e}")))?;
        self.shared.set_state(TransportState::GatheringIce);

        // Gathering can stall below "complete"; the candidate-count poll
        // guarantees we move on with whatever was gathered.
        tokio::select! {
            _ = gather_complete.recv() => debug!("ICE gathering complete"),
            _ = candidate_stall_poll(
                Arc::clone(&self.candidate_count),
                Duration::from_millis(self.config.ice_poll_interval_ms),
                Duration::from_millis(self.config.ice_max_wait_ms),
            ) => debug!("ICE gathering settled at {} candidates", self.candidate_count.load(Ordering::SeqCst)),
        }

        self.shared.set_state(TransportState::Negotiating);
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| RelayError::backend(Backend::Rendering, "no local description"))?;
        let answer = self
            .signaling
            .exchange_offer(&SessionOffer {
                sdp: local.sdp.clone(),
                kind: local.sdp_type.to_string(),
            })
            .await?;
        let answer = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| RelayError::malformed(Backend::Rendering, format!("answer sdp: {e}")))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| RelayError::backend(Backend::Rendering, format!("remote sdp: {e}")))?;

        *lock(&self.pc) = Some(pc);
        *lock(&self.dc) = Some(dc);
        info!("transport negotiating; awaiting data channel handshake");
        Ok(())
    }

    /// Wire the data-channel lifecycle: handshake on open, `Connected`
    /// on first acknowledgment, keepalive pings thereafter.
    fn install_channel_callbacks(&self, dc: &Arc<RTCDataChannel>) {
        let shared = Arc::clone(&self.shared);
        let signaling = Arc::clone(&self.signaling);
        let init = RenderSessionInit {
            face_id: self.face_id.clone(),
            is_jpg: false,
            api_key: self.api_key.clone(),
            sync_audio: true,
            handle_silence: true,
        };
        let handshake_dc = Arc::clone(dc);
        dc.on_open(Box::new(move || {
            let shared = Arc::clone(&shared);
            let signaling = Arc::clone(&signaling);
            let init = init.clone();
            let handshake_dc = Arc::clone(&handshake_dc);
            Box::pin(async move {
                match signaling.create_render_session(&init).await {
                    Ok(token) => {
                        if let Err(e) = handshake_dc.send_text(token).await {
                            warn!("handshake send failed: {e}");
                            shared.set_state(TransportState::Failed);
                        } else {
                            debug!("initialization handshake sent");
                        }
                    }
                    Err(e) => {
                        warn!("render session creation failed: {e}");
                        shared.set_state(TransportState::Failed);
                    }
                }
            })
        }));

        let shared = Arc::clone(&self.shared);
        let ping_dc = Arc::clone(dc);
        let ping_interval = Duration::from_millis(self.config.keepalive_interval_ms);
        dc.on_message(Box::new(move |message| {
            let shared = Arc::clone(&shared);
            let ping_dc = Arc::clone(&ping_dc);
            Box::pin(async move {
                // The first message back acknowledges the handshake;
                // everything after is rendering-service chatter.
                if shared.acked.swap(true, Ordering::SeqCst) {
                    debug!("data channel message: {} bytes", message.data.len());
                    return;
                }
                info!("handshake acknowledged; transport connected");
                shared.set_state(TransportState::Connected);
                let handle = tokio::spawn(run_keepalive(ping_dc, ping_interval));
                *lock(&shared.keepalive) = Some(handle);
            })
        }));
    }

    /// Forward one synthesized audio frame on the data channel.
    ///
    /// Fire-and-forget, at-most-once, ordered. While the transport is
    /// not `Connected` the call fails. Stale audio is worse than
    /// dropped audio for a live avatar, so nothing is ever queued.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::TransportNotReady`] before the handshake is
    /// acknowledged or after close.
    pub async fn send_audio(&self, frame: Bytes) -> Result<()> {
        let state = self.state();
        if state != TransportState::Connected {
            return Err(RelayError::TransportNotReady(state));
        }
        let dc = lock(&self.dc)
            .clone()
            .ok_or(RelayError::TransportNotReady(state))?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(RelayError::TransportNotReady(state));
        }
        dc.send(&frame)
            .await
            .map_err(|e| RelayError::backend(Backend::Rendering, format!("send audio: {e}")))?;
        Ok(())
    }

    /// Tear the transport down. Idempotent.
    pub async fn close(&self) {
        if let Some(handle) = lock(&self.shared.keepalive).take() {
            handle.abort();
        }
        let dc = lock(&self.dc).take();
        if let Some(dc) = dc {
            let _ = dc.close().await;
        }
        let pc = lock(&self.pc).take();
        if let Some(pc) = pc {
            let _ = pc.close().await;
        }
        self.shared.set_state(TransportState::Closed);
    }
}

/// Resolve when the candidate count stalls across one poll interval or
/// the deadline passes. Terminates even if gathering never completes.
async fn candidate_stall_poll(
    count: Arc<AtomicUsize>,
    poll_interval: Duration,
    max_wait: Duration,
) {
    let deadline = tokio::time::Instant::now() + max_wait;
    let mut previous: Option<usize> = None;
    loop {
        let current = count.load(Ordering::SeqCst);
        if previous == Some(current) {
            return;
        }
        previous = Some(current);
        if tokio::time::Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn run_keepalive(dc: Arc<RTCDataChannel>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut seq: u64 = 0;
    loop {
        ticker.tick().await;
        seq += 1;
        if dc.send_text(format!("ping {seq}")).await.is_err() {
            debug!("keepalive stopped; data channel gone");
            return;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubSignaling;

    #[async_trait]
    impl SignalingClient for StubSignaling {
        async fn exchange_offer(&self, _offer: &SessionOffer) -> Result<signaling::SessionAnswer> {
            Err(RelayError::Signaling("unreachable in tests".to_owned()))
        }

        async fn create_render_session(&self, _init: &RenderSessionInit) -> Result<String> {
            Ok("token".to_owned())
        }
    }

    fn transport() -> MediaTransport {
        let config = TransportConfig {
            api_key: Some("render-key".to_owned()),
            ..TransportConfig::default()
        };
        MediaTransport::new(&config, Arc::new(StubSignaling), "face-1").expect("transport")
    }

    #[tokio::test]
    async fn starts_in_new_state() {
        let transport = transport();
        assert_eq!(transport.state(), TransportState::New);
        assert!(transport.remote_tracks().is_some());
        assert!(transport.remote_tracks().is_none());
    }

    #[tokio::test]
    async fn send_audio_fails_loudly_before_connection() {
        let transport = transport();
        let result = transport.send_audio(Bytes::from_static(b"pcm")).await;
        match result {
            Err(RelayError::TransportNotReady(state)) => {
                assert_eq!(state, TransportState::New);
            }
            other => panic!("expected TransportNotReady, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_observable() {
        let transport = transport();
        let mut states = transport.subscribe_state();

        transport.close().await;
        assert_eq!(transport.state(), TransportState::Closed);
        transport.close().await;
        assert_eq!(transport.state(), TransportState::Closed);

        states.changed().await.expect("state change");
        assert_eq!(*states.borrow(), TransportState::Closed);

        // Closed is not Connected: audio is still rejected.
        assert!(matches!(
            transport.send_audio(Bytes::from_static(b"pcm")).await,
            Err(RelayError::TransportNotReady(TransportState::Closed))
        ));
    }

    #[tokio::test]
    async fn start_refused_outside_new() {
        let transport = transport();
        transport.close().await;
        assert!(matches!(
            transport.start().await,
            Err(RelayError::TransportNotReady(TransportState::Closed))
        ));
    }

    #[tokio::test]
    async fn stall_poll_returns_when_count_freezes() {
        let count = Arc::new(AtomicUsize::new(0));
        let poller = candidate_stall_poll(
            Arc::clone(&count),
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        // No candidates ever arrive: the poll settles after one interval.
        tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .expect("stall poll terminated");
    }

    #[tokio::test]
    async fn stall_poll_bounded_even_with_constant_churn() {
        let count = Arc::new(AtomicUsize::new(0));
        let churn_count = Arc::clone(&count);
        let churn = tokio::spawn(async move {
            loop {
                churn_count.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let poller = candidate_stall_poll(
            Arc::clone(&count),
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        tokio::time::timeout(Duration::from_secs(2), poller)
            .await
            .expect("deadline bounded the poll");
        churn.abort();
    }

    #[test]
    fn missing_render_key_is_a_config_error() {
        let config = TransportConfig::default();
        // GOLEM_RENDER_API_KEY is not set in the test environment.
        if std::env::var("GOLEM_RENDER_API_KEY").is_err() {
            assert!(MediaTransport::new(&config, Arc::new(StubSignaling), "f").is_err());
        }
    }
}

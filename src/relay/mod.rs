//! Session bootstrap and the client session socket.
//!
//! `POST /start-conversation` registers a session and returns its
//! connection id; `GET /ws?connectionId=` upgrades to the session socket.
//! The id is validated against the registry before the upgrade completes,
//! so unknown ids never reach session logic.

pub mod channel;
pub mod socket;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::generation::GenerationBackend;
use crate::recognition::RecognitionBackend;
use crate::registry::{Session, SessionRegistry};
use crate::synthesis::SynthesisBackend;
use axum::Router;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// Explicitly constructed service clients shared by all sessions.
pub struct Backends {
    /// Speech-recognition service client.
    pub recognition: Arc<dyn RecognitionBackend>,
    /// Language-generation service client.
    pub generation: Arc<dyn GenerationBackend>,
    /// Speech-synthesis service client.
    pub synthesis: Arc<dyn SynthesisBackend>,
}

#[derive(Clone)]
struct RelayState {
    registry: Arc<SessionRegistry>,
    backends: Arc<Backends>,
    config: Arc<RelayConfig>,
}

/// Running relay server.
pub struct RelayServer {
    addr: SocketAddr,
    serve_task: JoinHandle<()>,
}

impl RelayServer {
    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be bound.
    pub async fn bind(
        config: RelayConfig,
        registry: Arc<SessionRegistry>,
        backends: Backends,
    ) -> Result<Self> {
        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        let state = RelayState {
            registry,
            backends: Arc::new(backends),
            config: Arc::new(config),
        };
        let app = Router::new()
            .route("/start-conversation", post(start_conversation))
            .route("/ws", get(session_socket))
            // The viewer is a browser on another origin.
            .layer(CorsLayer::permissive())
            .with_state(state);

        let serve_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("relay server exited: {e}");
            }
        });

        info!("relay listening on http://{local_addr}");
        Ok(Self {
            addr: local_addr,
            serve_task,
        })
    }

    /// The bound listen address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        self.serve_task.abort();
    }

    /// Run until the server task ends.
    pub async fn join(self) {
        let _ = self.serve_task.await;
    }
}

#[derive(Debug, Deserialize)]
struct StartConversationRequest {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default, rename = "voiceId")]
    voice_id: Option<String>,
}

async fn start_conversation(
    State(state): State<RelayState>,
    Json(body): Json<StartConversationRequest>,
) -> impl IntoResponse {
    let prompt = body.prompt.as_deref().map(str::trim).unwrap_or_default();
    let voice_id = body.voice_id.as_deref().map(str::trim).unwrap_or_default();
    if prompt.is_empty() || voice_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "prompt and voiceId are required"})),
        );
    }

    let connection_id = state.registry.create(prompt, voice_id);
    (
        StatusCode::OK,
        Json(serde_json::json!({"connectionId": connection_id})),
    )
}

#[derive(Debug, Deserialize)]
struct SocketQuery {
    #[serde(default, rename = "connectionId")]
    connection_id: Option<String>,
}

async fn session_socket(
    State(state): State<RelayState>,
    Query(query): Query<SocketQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let session = match lookup_session(&state.registry, query.connection_id) {
        Ok(session) => session,
        Err(e) => {
            warn!("socket upgrade rejected: {e}");
            return (StatusCode::FORBIDDEN, e.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| {
        socket::run_session_socket(
            socket,
            Arc::clone(&state.registry),
            session,
            Arc::clone(&state.backends),
            Arc::clone(&state.config),
        )
    })
}

/// Validate the handshake id against the registry. Rejection happens
/// here, at the transport boundary, never inside session logic.
fn lookup_session(
    registry: &SessionRegistry,
    connection_id: Option<String>,
) -> Result<Arc<Session>> {
    let id = connection_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| RelayError::ConnectionNotFound("missing connectionId".to_owned()))?;
    registry
        .get(&id)
        .ok_or(RelayError::ConnectionNotFound(id))
}

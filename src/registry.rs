//! Session registry: the exclusive owner of per-session state.
//!
//! Sessions are keyed by an opaque id handed out at bootstrap and looked
//! up again when the client socket upgrades. All cross-session contact
//! goes through id-keyed insert/lookup/delete; nothing iterates sessions
//! on the hot path.

use crate::relay::channel::ClientChannel;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Opaque session identifier, unique for the process lifetime.
pub type SessionId = String;

/// One end-to-end conversation, from audio capture to avatar rendering.
///
/// Created at bootstrap with metadata only; no backend connection is
/// opened until the client socket attaches. Destroyed at most once, by
/// the registry.
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Persona instruction for the generation backend.
    pub prompt: String,
    /// Voice selector for the synthesis backend.
    pub voice_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Cancelled exactly once on destroy; every pump task owned by this
    /// session selects on it.
    cancel: CancellationToken,
    channel: Mutex<Option<ClientChannel>>,
}

impl Session {
    fn new(prompt: &str, voice_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.to_owned(),
            voice_id: voice_id.to_owned(),
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            channel: Mutex::new(None),
        }
    }

    /// Token cancelled when the session is destroyed.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Attach the client channel on socket upgrade.
    ///
    /// # Errors
    ///
    /// Fails if a socket is already attached; one recognition pipeline
    /// per session.
    pub fn attach_channel(&self, channel: ClientChannel) -> crate::error::Result<()> {
        let mut slot = lock(&self.channel);
        if slot.is_some() {
            return Err(crate::error::RelayError::Channel(format!(
                "session {} already has a socket attached",
                self.id
            )));
        }
        *slot = Some(channel);
        Ok(())
    }

    /// The attached client channel, if any.
    pub fn channel(&self) -> Option<ClientChannel> {
        lock(&self.channel).clone()
    }
}

/// Process-wide map of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and return its id.
    ///
    /// Stores metadata only; backends open lazily once the socket
    /// attaches.
    pub fn create(&self, prompt: &str, voice_id: &str) -> SessionId {
        let session = Arc::new(Session::new(prompt, voice_id));
        let id = session.id.clone();
        lock(&self.sessions).insert(id.clone(), session);
        info!("session {id} created");
        id
    }

    /// Look up a session. Unknown ids never auto-create.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        lock(&self.sessions).get(id).cloned()
    }

    /// Whether the session still exists. In-flight continuations check
    /// this before side effects on the client channel or a backend
    /// handle.
    pub fn live(&self, id: &str) -> bool {
        lock(&self.sessions).contains_key(id)
    }

    /// Destroy a session, releasing every owned pump, socket and timer.
    ///
    /// Idempotent: a second call, or a call after the socket already
    /// closed, is a no-op.
    pub fn destroy(&self, id: &str) {
        let removed = lock(&self.sessions).remove(id);
        match removed {
            Some(session) => {
                session.cancel.cancel();
                info!("session {id} destroyed");
            }
            None => debug!("destroy for unknown session {id} ignored"),
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

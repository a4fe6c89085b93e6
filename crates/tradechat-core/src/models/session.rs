use std::fmt;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::message::Message;
use super::transcript_store::TranscriptStore;
use crate::error::{ChatError, ChatResult};
use crate::services::backend::ChatBackend;
use crate::services::error_format::describe_error;

/// Tier currently carrying the active request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportMode {
    #[default]
    Idle,
    Socket,
    Stream,
    Fallback,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportMode::Idle => "idle",
            TransportMode::Socket => "socket",
            TransportMode::Stream => "stream",
            TransportMode::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

/// Owns the server-side session id of the conversation.
///
/// Creation is serialized: concurrent callers of
/// [`SessionManager::ensure_session`] share one backend call.
pub struct SessionManager {
    creating: tokio::sync::Mutex<()>,
    session_id: Mutex<Option<String>>,
    mode: Mutex<TransportMode>,
    welcome_message: String,
}

impl SessionManager {
    pub fn new(welcome_message: impl Into<String>) -> Self {
        Self {
            creating: tokio::sync::Mutex::new(()),
            session_id: Mutex::new(None),
            mode: Mutex::new(TransportMode::Idle),
            welcome_message: welcome_message.into(),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// Return the current session, creating one if there is none.
    ///
    /// A fresh session greets the user with the welcome message. On failure
    /// the described error is appended to the transcript and no session is
    /// recorded, so the next call retries.
    pub async fn ensure_session(
        &self,
        backend: &dyn ChatBackend,
        store: &TranscriptStore,
    ) -> ChatResult<String> {
        if let Some(id) = self.session_id() {
            return Ok(id);
        }

        let _guard = self.creating.lock().await;
        if let Some(id) = self.session_id() {
            return Ok(id);
        }

        match backend.create_session().await {
            Ok(id) => {
                info!(session_id = %id, "Chat session started");
                *self.session_id.lock() = Some(id.clone());
                store.append(Message::assistant(self.welcome_message.clone()));
                Ok(id)
            }
            Err(e) => {
                warn!(error = ?e, "Failed to create chat session");
                store.append(Message::system(describe_error(&e)).with_extra("error_kind", "session"));
                Err(ChatError::Session(e))
            }
        }
    }

    /// Adopt an existing session id without contacting the backend
    pub fn resume(&self, session_id: impl Into<String>) {
        *self.session_id.lock() = Some(session_id.into());
    }

    /// Forget the session; the next send creates a new one
    pub fn reset(&self) {
        *self.session_id.lock() = None;
        *self.mode.lock() = TransportMode::Idle;
    }

    pub fn mode(&self) -> TransportMode {
        *self.mode.lock()
    }

    pub fn set_mode(&self, mode: TransportMode) {
        *self.mode.lock() = mode;
    }
}

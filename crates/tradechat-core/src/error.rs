use serde_json::Value;
use thiserror::Error;

/// Failures of a single transport call (HTTP, push socket or SSE stream).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned status {status}")]
    Status { status: u16, body: Option<Value> },

    /// 2xx reply whose body reported `success: false`.
    #[error("Request was rejected by the server")]
    Rejected { body: Value },

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    /// Structured JSON payload attached to the error, if the server sent one.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Status { body, .. } => body.as_ref(),
            Self::Rejected { body } => Some(body),
            _ => None,
        }
    }
}

/// A chunk that could not be turned into a [`crate::services::Chunk`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Chunk has no `type` field")]
    MissingType,

    #[error("Invalid `{kind}` chunk: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
}

/// Errors surfaced to callers of the chat engine.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("A response is still streaming")]
    RequestInFlight,

    #[error("Chat session unavailable: {0}")]
    Session(#[source] ClientError),

    #[error("No transcript cache configured")]
    NoRepository,

    #[error(transparent)]
    Repository(#[from] crate::repositories::RepositoryError),
}

pub type ChatResult<T> = Result<T, ChatError>;

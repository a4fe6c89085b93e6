use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use super::error::RepositoryResult;
use crate::models::message::Message;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Cached transcript of one chat session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptData {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub updated_at: i64, // Unix timestamp
}

impl TranscriptData {
    pub fn new(session_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            session_id: session_id.into(),
            messages,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Repository trait for transcript caching
pub trait TranscriptRepository: Send + Sync + 'static {
    /// Load the cached transcript of a session, if any
    fn load(&self, session_id: &str) -> BoxFuture<'static, RepositoryResult<Option<TranscriptData>>>;

    /// Overwrite the cached transcript of a session
    fn save(&self, data: TranscriptData) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Drop the cached transcript of a session. Missing entries are not an error.
    fn clear(&self, session_id: &str) -> BoxFuture<'static, RepositoryResult<()>>;
}

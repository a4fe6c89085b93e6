use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::RepositoryResult;
use super::transcript_repository::{BoxFuture, TranscriptData, TranscriptRepository};

/// In-memory transcript cache
/// Useful for testing and for running without a data directory
#[derive(Clone, Default)]
pub struct InMemoryTranscriptRepository {
    transcripts: Arc<Mutex<HashMap<String, TranscriptData>>>,
}

impl InMemoryTranscriptRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transcripts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transcripts.lock().is_empty()
    }
}

impl TranscriptRepository for InMemoryTranscriptRepository {
    fn load(&self, session_id: &str) -> BoxFuture<'static, RepositoryResult<Option<TranscriptData>>> {
        let found = self.transcripts.lock().get(session_id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn save(&self, data: TranscriptData) -> BoxFuture<'static, RepositoryResult<()>> {
        let transcripts = self.transcripts.clone();
        Box::pin(async move {
            transcripts.lock().insert(data.session_id.clone(), data);
            Ok(())
        })
    }

    fn clear(&self, session_id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let transcripts = self.transcripts.clone();
        let session_id = session_id.to_string();
        Box::pin(async move {
            transcripts.lock().remove(&session_id);
            Ok(())
        })
    }
}

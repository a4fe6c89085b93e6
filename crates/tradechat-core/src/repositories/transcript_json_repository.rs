use std::path::PathBuf;

use super::error::{RepositoryError, RepositoryResult};
use super::transcript_repository::{BoxFuture, TranscriptData, TranscriptRepository};

/// JSON file-based transcript cache
/// Stores each session as a separate file in <data_dir>/tradechat/transcripts/
pub struct TranscriptJsonRepository {
    transcripts_dir: PathBuf,
}

impl TranscriptJsonRepository {
    pub fn new() -> RepositoryResult<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| RepositoryError::InitializationError {
                message: "Could not determine data directory".to_string(),
            })?
            .join("tradechat")
            .join("transcripts");

        Ok(Self::with_dir(data_dir))
    }

    pub fn with_dir(transcripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            transcripts_dir: transcripts_dir.into(),
        }
    }

    fn transcript_path(&self, session_id: &str) -> PathBuf {
        // Session ids come from the server; keep them from escaping the directory
        let file_name: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.transcripts_dir.join(format!("{}.json", file_name))
    }
}

impl TranscriptRepository for TranscriptJsonRepository {
    fn load(&self, session_id: &str) -> BoxFuture<'static, RepositoryResult<Option<TranscriptData>>> {
        let path = self.transcript_path(session_id);

        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                if !path.exists() {
                    return Ok(None);
                }
                let content = std::fs::read_to_string(&path)?;
                let data: TranscriptData = serde_json::from_str(&content)?;
                Ok(Some(data))
            })
            .await?
        })
    }

    fn save(&self, data: TranscriptData) -> BoxFuture<'static, RepositoryResult<()>> {
        let path = self.transcript_path(&data.session_id);
        let transcripts_dir = self.transcripts_dir.clone();

        Box::pin(async move {
            let json = serde_json::to_string_pretty(&data)?;

            tokio::task::spawn_blocking(move || {
                std::fs::create_dir_all(&transcripts_dir)?;

                // Write atomically using temp file + rename
                let temp_path = path.with_extension("json.tmp");
                std::fs::write(&temp_path, &json)?;
                std::fs::rename(&temp_path, &path)?;

                Ok::<(), RepositoryError>(())
            })
            .await?
        })
    }

    fn clear(&self, session_id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let path = self.transcript_path(session_id);

        Box::pin(async move {
            tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(RepositoryError::IoError(e)),
            })
            .await?
        })
    }
}

pub mod error;
pub mod in_memory_repository;
pub mod transcript_json_repository;
pub mod transcript_repository;

pub use error::{RepositoryError, RepositoryResult};
pub use in_memory_repository::InMemoryTranscriptRepository;
pub use transcript_json_repository::TranscriptJsonRepository;
pub use transcript_repository::{BoxFuture, TranscriptData, TranscriptRepository};

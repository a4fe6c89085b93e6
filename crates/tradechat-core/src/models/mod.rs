pub mod decision_store;
pub mod error_store;
pub mod message;
pub mod session;
pub mod transcript_store;

pub use decision_store::{DecisionStore, OfferOutcome, PendingDecision};
pub use error_store::{ErrorEntry, ErrorLevel, ErrorStore};
pub use message::{Message, MessageMetadata, ProgressEvent, Role, transcript_order};
pub use session::{SessionManager, TransportMode};
pub use transcript_store::{TranscriptEvent, TranscriptStore};

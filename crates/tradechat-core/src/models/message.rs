use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Author of a transcript entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Tie-break rank for messages sharing a timestamp. User turns sort first.
    pub fn priority(self) -> u8 {
        match self {
            Role::User => 0,
            Role::Assistant | Role::System => 1,
        }
    }
}

/// One reported phase of backend processing, keyed by `stage`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Message metadata. Known keys are typed; anything else the backend sends
/// lands in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub streaming: bool,

    /// Progress history of the request that produced this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub progress: Vec<ProgressEvent>,

    /// Rendered progress bar value (max percent seen so far)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<String>,

    /// Trade action payload proposed by the assistant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A transcript entry. Updated only by replacement; `id` is stable across
/// every update of the same logical turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            role,
            timestamp: Utc::now(),
            intent: None,
            confidence: None,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Empty assistant entry shown while a response streams in
    pub fn placeholder() -> Self {
        let mut message = Self::new(Role::Assistant, "");
        message.metadata.streaming = true;
        message
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.metadata.streaming
    }

    /// Clamp a backend confidence score into `[0, 1]`, dropping non-finite values.
    pub fn clamp_confidence(raw: Option<f64>) -> Option<f64> {
        raw.filter(|c| c.is_finite()).map(|c| c.clamp(0.0, 1.0))
    }
}

/// Transcript order: timestamp, then user before any other role, then id.
pub fn transcript_order(a: &Message, b: &Message) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.role.priority().cmp(&b.role.priority()))
        .then_with(|| a.id.cmp(&b.id))
}

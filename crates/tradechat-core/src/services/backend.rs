use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ClientError;
use crate::services::protocol::{Completion, null_as_empty};

/// Chunk JSON values of one SSE response, in arrival order
pub type ChunkStream = BoxStream<'static, Result<Value, ClientError>>;

/// Body of a chat message, shared by the fallback POST and the SSE query
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MessageRequest {
    pub message: String,
    pub session_id: String,
    pub request_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SessionReply {
    pub session_id: String,
}

/// Non-streaming reply of the fallback tier
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct FallbackReply {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub metadata: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl From<FallbackReply> for Completion {
    fn from(reply: FallbackReply) -> Self {
        Completion {
            content: Some(reply.content),
            message_id: reply.message_id,
            intent: reply.intent,
            confidence: reply.confidence,
            metadata: reply.metadata,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DecisionRequest {
    pub decision_id: String,
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifications: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct DecisionReply {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub execution_result: Option<Value>,
}

/// Request/response side of the chat API.
///
/// The push socket lives behind [`crate::services::PushChannel`]; everything
/// here is one-shot HTTP except [`ChatBackend::open_stream`].
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Create a new server-side chat session and return its id
    async fn create_session(&self) -> Result<String, ClientError>;

    /// Fallback tier: post a message and wait for the complete reply
    async fn send_message(&self, request: &MessageRequest) -> Result<FallbackReply, ClientError>;

    /// Approve or decline a proposed trade action
    async fn resolve_decision(&self, request: &DecisionRequest) -> Result<DecisionReply, ClientError>;

    /// Streaming tier: open an SSE response for the message
    async fn open_stream(&self, request: &MessageRequest) -> Result<ChunkStream, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fallback_reply_maps_to_completion() {
        let reply: FallbackReply = serde_json::from_value(json!({
            "success": true,
            "message_id": "m1",
            "content": "X",
            "timestamp": "2024-05-01T10:00:00Z",
            "intent": "price_check",
            "confidence": 0.8,
            "metadata": null
        }))
        .unwrap();
        let completion = Completion::from(reply);
        assert_eq!(completion.content.as_deref(), Some("X"));
        assert_eq!(completion.message_id.as_deref(), Some("m1"));
        assert!(completion.metadata.is_empty());
    }

    #[test]
    fn test_decision_request_omits_empty_modifications() {
        let request = DecisionRequest {
            decision_id: "d1".to_string(),
            approved: false,
            modifications: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"decision_id": "d1", "approved": false})
        );
    }
}

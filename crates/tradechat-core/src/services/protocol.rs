//! Wire vocabulary shared by the push socket, the SSE stream and the
//! fallback reply.
//!
//! Chunks arrive as loosely shaped JSON. Known `type` tags are validated into
//! concrete payloads here, at the parse boundary; only unrecognized tags keep
//! an open shape.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Backend processing phases that arrive as their own chunk type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    Thinking,
    Analyzing,
    GatheringData,
    Processing,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Thinking => "thinking",
            StageKind::Analyzing => "analyzing",
            StageKind::GatheringData => "gathering_data",
            StageKind::Processing => "processing",
        }
    }

    /// Percent used when the chunk does not report one
    pub fn default_percent(self) -> f64 {
        match self {
            StageKind::Thinking => 10.0,
            StageKind::Analyzing => 25.0,
            StageKind::GatheringData => 45.0,
            StageKind::Processing => 60.0,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            StageKind::Thinking => "Thinking...",
            StageKind::Analyzing => "Analyzing your request...",
            StageKind::GatheringData => "Gathering market data...",
            StageKind::Processing => "Processing...",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "thinking" => Some(StageKind::Thinking),
            "analyzing" => Some(StageKind::Analyzing),
            "gathering_data" => Some(StageKind::GatheringData),
            "processing" => Some(StageKind::Processing),
            _ => None,
        }
    }
}

/// Progress fields, either top-level on a stage chunk or nested under
/// `progress` on a `progress` chunk
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ProgressUpdate {
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub percent: Option<f64>,
}

#[derive(Deserialize)]
struct NestedProgress {
    #[serde(default)]
    progress: ProgressUpdate,
}

#[derive(Deserialize)]
struct ContentPayload {
    #[serde(alias = "text", alias = "delta")]
    content: String,
}

#[derive(Deserialize)]
struct PersonaPayload {
    #[serde(alias = "text")]
    content: String,
    #[serde(default)]
    replaces_previous: bool,
}

/// Confirmation request for a proposed trade action
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ActionRequest {
    pub decision_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub action: Option<Value>,
    #[serde(default)]
    pub risk_level: Option<String>,
}

/// Explicit server-side failure
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ServerError {
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: Option<Value>,
}

/// Terminal chunk of a successful response. The fallback reply is mapped
/// onto the same shape.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Completion {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub metadata: Map<String, Value>,
}

/// Accept `"metadata": null` as an empty map.
pub(crate) fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Completion {
    /// Decision id when the final metadata asks for trade approval
    pub fn approval_decision_id(&self) -> Option<&str> {
        let requires = self
            .metadata
            .get("requires_approval")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !requires {
            return None;
        }
        self.metadata.get("decision_id").and_then(Value::as_str)
    }
}

/// One unit of a streamed response
#[derive(Clone, Debug, PartialEq)]
pub enum Chunk {
    Stage {
        kind: StageKind,
        update: ProgressUpdate,
    },
    Progress(ProgressUpdate),
    /// `response` or `chunk`: a content delta
    Content(String),
    PersonaEnriched {
        content: String,
        replaces_previous: bool,
    },
    ActionRequired(ActionRequest),
    Error(ServerError),
    Complete(Completion),
    /// Tag this client does not know; `content` is appended when textual
    Unknown {
        kind: String,
        content: Option<String>,
    },
}

impl Chunk {
    pub fn parse(value: &Value) -> Result<Self, ProtocolError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        let invalid = |source| ProtocolError::InvalidPayload {
            kind: kind.to_string(),
            source,
        };

        if let Some(stage) = StageKind::from_tag(kind) {
            let update: ProgressUpdate =
                serde_json::from_value(value.clone()).map_err(invalid)?;
            return Ok(Chunk::Stage {
                kind: stage,
                update,
            });
        }

        let chunk = match kind {
            "progress" => {
                let nested: NestedProgress =
                    serde_json::from_value(value.clone()).map_err(invalid)?;
                Chunk::Progress(nested.progress)
            }
            "response" | "chunk" => {
                let payload: ContentPayload =
                    serde_json::from_value(value.clone()).map_err(invalid)?;
                Chunk::Content(payload.content)
            }
            "persona_enriched" => {
                let payload: PersonaPayload =
                    serde_json::from_value(value.clone()).map_err(invalid)?;
                Chunk::PersonaEnriched {
                    content: payload.content,
                    replaces_previous: payload.replaces_previous,
                }
            }
            "action_required" => {
                Chunk::ActionRequired(serde_json::from_value(value.clone()).map_err(invalid)?)
            }
            "error" => Chunk::Error(serde_json::from_value(value.clone()).map_err(invalid)?),
            "complete" => {
                Chunk::Complete(serde_json::from_value(value.clone()).map_err(invalid)?)
            }
            other => Chunk::Unknown {
                kind: other.to_string(),
                content: value
                    .get("content")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
        };
        Ok(chunk)
    }

    pub fn kind(&self) -> &str {
        match self {
            Chunk::Stage { kind, .. } => kind.as_str(),
            Chunk::Progress(_) => "progress",
            Chunk::Content(_) => "response",
            Chunk::PersonaEnriched { .. } => "persona_enriched",
            Chunk::ActionRequired(_) => "action_required",
            Chunk::Error(_) => "error",
            Chunk::Complete(_) => "complete",
            Chunk::Unknown { kind, .. } => kind,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Chunk::Error(_) | Chunk::Complete(_))
    }
}

/// Client → server frame on the push socket
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ChatMessage {
        message: String,
        session_id: String,
        request_id: String,
    },
}

#[derive(Deserialize)]
struct ServerFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    chunk: Option<Value>,
    #[serde(default)]
    request_id: Option<String>,
}

/// Decoded server → client socket traffic
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    Chunk {
        request_id: Option<String>,
        payload: Value,
    },
    Disconnected {
        reason: String,
    },
}

/// Decode one socket text frame. Frames other than `chat_response`
/// (`connected`, `pong`, …) yield `None`.
pub fn decode_server_frame(text: &str) -> Result<Option<InboundFrame>, ProtocolError> {
    let frame: ServerFrame = serde_json::from_str(text)?;
    if frame.kind != "chat_response" {
        return Ok(None);
    }
    let Some(payload) = frame.chunk else {
        return Err(ProtocolError::MissingType);
    };
    let request_id = frame.request_id.or_else(|| {
        payload
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    Ok(Some(InboundFrame::Chunk {
        request_id,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_stage_chunk() {
        let chunk = Chunk::parse(&json!({"type": "analyzing", "message": "Looking", "percent": 30})).unwrap();
        match chunk {
            Chunk::Stage { kind, update } => {
                assert_eq!(kind, StageKind::Analyzing);
                assert_eq!(update.message.as_deref(), Some("Looking"));
                assert_eq!(update.percent, Some(30.0));
            }
            other => panic!("unexpected chunk: {:?}", other),
        }
    }

    #[test]
    fn test_parse_nested_progress() {
        let chunk = Chunk::parse(&json!({
            "type": "progress",
            "progress": {"stage": "pricing", "message": "Pricing", "percent": 42.6}
        }))
        .unwrap();
        assert_eq!(
            chunk,
            Chunk::Progress(ProgressUpdate {
                stage: Some("pricing".to_string()),
                message: Some("Pricing".to_string()),
                percent: Some(42.6),
            })
        );
    }

    #[test]
    fn test_parse_content_aliases() {
        assert_eq!(
            Chunk::parse(&json!({"type": "response", "content": "Here"})).unwrap(),
            Chunk::Content("Here".to_string())
        );
        assert_eq!(
            Chunk::parse(&json!({"type": "chunk", "text": " is"})).unwrap(),
            Chunk::Content(" is".to_string())
        );
    }

    #[test]
    fn test_content_chunk_without_text_is_invalid() {
        let err = Chunk::parse(&json!({"type": "response"})).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { ref kind, .. } if kind == "response"));
    }

    #[test]
    fn test_missing_type() {
        assert!(matches!(
            Chunk::parse(&json!({"content": "x"})),
            Err(ProtocolError::MissingType)
        ));
    }

    #[test]
    fn test_parse_persona_defaults_to_append() {
        let chunk = Chunk::parse(&json!({"type": "persona_enriched", "content": "Ahoy"})).unwrap();
        assert_eq!(
            chunk,
            Chunk::PersonaEnriched {
                content: "Ahoy".to_string(),
                replaces_previous: false
            }
        );
    }

    #[test]
    fn test_parse_action_required() {
        let chunk = Chunk::parse(&json!({
            "type": "action_required",
            "decision_id": "d1",
            "message": "Buy 0.1 BTC?",
            "action": {"side": "buy", "symbol": "BTC", "amount": 0.1}
        }))
        .unwrap();
        match chunk {
            Chunk::ActionRequired(request) => {
                assert_eq!(request.decision_id, "d1");
                assert_eq!(request.action.unwrap()["side"], "buy");
            }
            other => panic!("unexpected chunk: {:?}", other),
        }
    }

    #[test]
    fn test_complete_approval_decision() {
        let chunk = Chunk::parse(&json!({
            "type": "complete",
            "metadata": {"requires_approval": true, "decision_id": "d7"}
        }))
        .unwrap();
        let Chunk::Complete(completion) = chunk else {
            panic!("expected complete");
        };
        assert_eq!(completion.approval_decision_id(), Some("d7"));

        let plain = Completion {
            metadata: json!({"decision_id": "d7"}).as_object().unwrap().clone(),
            ..Default::default()
        };
        assert_eq!(plain.approval_decision_id(), None);
    }

    #[test]
    fn test_unknown_kind_keeps_content() {
        let chunk = Chunk::parse(&json!({"type": "market_flash", "content": "BTC up"})).unwrap();
        assert_eq!(
            chunk,
            Chunk::Unknown {
                kind: "market_flash".to_string(),
                content: Some("BTC up".to_string())
            }
        );
        assert!(!chunk.is_terminal());
    }

    #[test]
    fn test_client_frame_shape() {
        let frame = ClientFrame::ChatMessage {
            message: "hi".to_string(),
            session_id: "s1".to_string(),
            request_id: "r1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "chat_message", "message": "hi", "session_id": "s1", "request_id": "r1"})
        );
    }

    #[test]
    fn test_decode_chat_response_frame() {
        let frame = decode_server_frame(
            r#"{"type":"chat_response","chunk":{"type":"response","content":"Hi","request_id":"r1"}}"#,
        )
        .unwrap()
        .unwrap();
        match frame {
            InboundFrame::Chunk { request_id, payload } => {
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(payload["content"], "Hi");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_decode_ignores_other_frames() {
        assert_eq!(decode_server_frame(r#"{"type":"pong"}"#).unwrap(), None);
        assert!(decode_server_frame("not json").is_err());
    }
}

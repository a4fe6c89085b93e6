use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::models::message::{Message, ProgressEvent};
use crate::services::error_format::describe_server_error;
use crate::services::protocol::{ActionRequest, Chunk, Completion, ProgressUpdate};

/// Stage recorded while content deltas are arriving
pub const GENERATING_STAGE: &str = "generating";
const GENERATING_PERCENT: f64 = 80.0;
const GENERATING_MESSAGE: &str = "Generating response...";

const PROGRESS_STAGE: &str = "progress";
const PROGRESS_PERCENT: f64 = 50.0;

/// Clamp to `[0, 100]` and round to the nearest integer. Non-finite input is 0.
pub fn normalize_percent(raw: f64) -> u8 {
    if !raw.is_finite() {
        return 0;
    }
    raw.clamp(0.0, 100.0).round() as u8
}

/// Progress events of one request, deduplicated by stage.
///
/// The rendered percent is the maximum ever reported, so it never moves
/// backwards when events arrive out of order.
#[derive(Clone, Debug, Default)]
pub struct ProgressTracker {
    events: Vec<ProgressEvent>,
    max_percent: u8,
}

impl ProgressTracker {
    pub fn record(&mut self, stage: &str, message: &str, percent: f64) {
        let percent = normalize_percent(percent);
        let event = ProgressEvent {
            stage: stage.to_string(),
            message: message.to_string(),
            percent: Some(percent),
            timestamp: Utc::now(),
        };
        match self.events.iter_mut().find(|e| e.stage == stage) {
            Some(existing) => *existing = event,
            None => self.events.push(event),
        }
        self.max_percent = self.max_percent.max(percent);
    }

    pub fn percent(&self) -> u8 {
        self.max_percent
    }

    pub fn events(&self) -> &[ProgressEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// What the caller must do after a chunk was folded in
#[derive(Clone, Debug, PartialEq)]
pub enum AssemblyStep {
    /// Nothing visible changed
    Ignored,
    /// Progress changed; re-render the placeholder
    Progress,
    /// Content changed; re-render the placeholder
    Content,
    /// Post a confirmation message and register a pending decision
    ActionRequired(ActionRequest),
    /// Terminal: drop the placeholder and show this text
    Failed(String),
    /// Terminal: finalize the placeholder
    Completed(Completion),
}

/// Working buffer for exactly one in-flight request.
///
/// Created when a message is sent and consumed when the request reaches a
/// terminal chunk; never reused across requests.
#[derive(Debug)]
pub struct StreamAccumulator {
    request_id: String,
    placeholder_id: String,
    content: String,
    progress: ProgressTracker,
    chunks: usize,
    finished: bool,
}

impl StreamAccumulator {
    pub fn new(request_id: impl Into<String>, placeholder_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            placeholder_id: placeholder_id.into(),
            content: String::new(),
            progress: ProgressTracker::default(),
            chunks: 0,
            finished: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn placeholder_id(&self) -> &str {
        &self.placeholder_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Number of chunks folded in so far
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fold one chunk into the buffer. Chunks after a terminal one are ignored.
    pub fn apply(&mut self, chunk: Chunk) -> AssemblyStep {
        if self.finished {
            debug!(request_id = %self.request_id, kind = chunk.kind(), "Chunk after terminal state ignored");
            return AssemblyStep::Ignored;
        }
        self.chunks += 1;

        match chunk {
            Chunk::Stage { kind, update } => {
                let message = update
                    .message
                    .as_deref()
                    .unwrap_or_else(|| kind.default_message());
                self.progress.record(
                    kind.as_str(),
                    message,
                    update.percent.unwrap_or_else(|| kind.default_percent()),
                );
                AssemblyStep::Progress
            }
            Chunk::Progress(ProgressUpdate {
                stage,
                message,
                percent,
            }) => {
                let stage = stage.unwrap_or_else(|| PROGRESS_STAGE.to_string());
                let message = message.unwrap_or_else(|| "Working...".to_string());
                self.progress
                    .record(&stage, &message, percent.unwrap_or(PROGRESS_PERCENT));
                AssemblyStep::Progress
            }
            Chunk::Content(text) => {
                self.append(&text);
                AssemblyStep::Content
            }
            Chunk::PersonaEnriched {
                content,
                replaces_previous,
            } => {
                if replaces_previous {
                    self.content = content;
                } else {
                    self.content.push_str(&content);
                }
                AssemblyStep::Content
            }
            Chunk::ActionRequired(request) => AssemblyStep::ActionRequired(request),
            Chunk::Error(error) => {
                self.finished = true;
                AssemblyStep::Failed(describe_server_error(&error))
            }
            Chunk::Complete(completion) => {
                self.finished = true;
                AssemblyStep::Completed(completion)
            }
            Chunk::Unknown {
                kind,
                content: Some(text),
            } => {
                debug!(request_id = %self.request_id, kind = %kind, "Unknown chunk kind appended as content");
                self.append(&text);
                AssemblyStep::Content
            }
            Chunk::Unknown { kind, content: None } => {
                debug!(request_id = %self.request_id, kind = %kind, "Unknown chunk kind without content skipped");
                AssemblyStep::Ignored
            }
        }
    }

    fn append(&mut self, text: &str) {
        self.content.push_str(text);
        self.progress
            .record(GENERATING_STAGE, GENERATING_MESSAGE, GENERATING_PERCENT);
    }

    /// Placeholder with the current draft and progress, still streaming
    pub fn render(&self, placeholder: &Message) -> Message {
        let mut next = placeholder.clone();
        next.content = self.content.clone();
        next.metadata.streaming = true;
        next.metadata.progress = self.progress.events().to_vec();
        next.metadata.progress_percent = if self.progress.is_empty() {
            None
        } else {
            Some(self.progress.percent())
        };
        next
    }

    /// Final form of the placeholder: content frozen, progress cleared,
    /// completion metadata merged, streaming flag off.
    pub fn finalize(&self, placeholder: &Message, completion: &Completion) -> Message {
        let mut next = placeholder.clone();
        next.content = if self.content.is_empty() {
            completion.content.clone().unwrap_or_default()
        } else {
            self.content.clone()
        };
        next.intent = completion.intent.clone().or(next.intent);
        next.confidence = Message::clamp_confidence(completion.confidence).or(next.confidence);

        let metadata = &mut next.metadata;
        metadata.streaming = false;
        metadata.progress.clear();
        metadata.progress_percent = None;
        for (key, value) in &completion.metadata {
            match key.as_str() {
                "streaming" | "progress" | "progress_percent" => {}
                "decision_id" => metadata.decision_id = value.as_str().map(str::to_string),
                "action" => metadata.action = Some(value.clone()),
                _ => {
                    metadata.extra.insert(key.clone(), value.clone());
                }
            }
        }
        if let Some(message_id) = &completion.message_id {
            metadata
                .extra
                .insert("message_id".to_string(), Value::String(message_id.clone()));
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(value: Value) -> Chunk {
        Chunk::parse(&value).unwrap()
    }

    fn accumulator() -> StreamAccumulator {
        StreamAccumulator::new("r1", "p1")
    }

    #[test]
    fn test_normalize_percent() {
        assert_eq!(normalize_percent(42.5), 43);
        assert_eq!(normalize_percent(42.4), 42);
        assert_eq!(normalize_percent(-3.0), 0);
        assert_eq!(normalize_percent(250.0), 100);
        assert_eq!(normalize_percent(f64::NAN), 0);
    }

    #[test]
    fn test_stage_uses_default_percent() {
        let mut acc = accumulator();
        assert_eq!(acc.apply(chunk(json!({"type": "thinking"}))), AssemblyStep::Progress);
        assert_eq!(acc.progress().percent(), 10);
        assert_eq!(acc.progress().events()[0].message, "Thinking...");
        assert!(acc.content().is_empty());
    }

    #[test]
    fn test_same_stage_replaces() {
        let mut acc = accumulator();
        acc.apply(chunk(json!({"type": "analyzing", "message": "first", "percent": 20})));
        acc.apply(chunk(json!({"type": "analyzing", "message": "second", "percent": 30})));
        let events = acc.progress().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "second");
    }

    #[test]
    fn test_percent_never_regresses() {
        let mut acc = accumulator();
        let mut seen = Vec::new();
        for percent in [30.0, 70.0, 20.0, 65.0, 90.0, 10.0] {
            acc.apply(chunk(json!({
                "type": "progress",
                "progress": {"stage": format!("s{}", percent), "percent": percent}
            })));
            seen.push(acc.progress().percent());
        }
        assert_eq!(seen, vec![30, 70, 70, 70, 90, 90]);
    }

    #[test]
    fn test_content_appends_and_sets_generating_floor() {
        let mut acc = accumulator();
        acc.apply(chunk(json!({"type": "processing", "percent": 10})));
        acc.apply(chunk(json!({"type": "response", "content": "Here"})));
        acc.apply(chunk(json!({"type": "chunk", "content": " is"})));
        assert_eq!(acc.content(), "Here is");
        assert_eq!(acc.progress().percent(), 80);
        let generating: Vec<_> = acc
            .progress()
            .events()
            .iter()
            .filter(|e| e.stage == GENERATING_STAGE)
            .collect();
        assert_eq!(generating.len(), 1);
    }

    #[test]
    fn test_persona_replace_and_append() {
        let mut acc = accumulator();
        acc.apply(chunk(json!({"type": "response", "content": "Draft text"})));
        acc.apply(chunk(json!({"type": "persona_enriched", "content": "Polished", "replaces_previous": true})));
        assert_eq!(acc.content(), "Polished");
        acc.apply(chunk(json!({"type": "persona_enriched", "content": " text"})));
        assert_eq!(acc.content(), "Polished text");
    }

    #[test]
    fn test_unknown_kind_with_content_appended() {
        let mut acc = accumulator();
        acc.apply(chunk(json!({"type": "response", "content": "A"})));
        assert_eq!(
            acc.apply(chunk(json!({"type": "novel_thing", "content": "B"}))),
            AssemblyStep::Content
        );
        assert_eq!(
            acc.apply(chunk(json!({"type": "novel_thing", "payload": 1}))),
            AssemblyStep::Ignored
        );
        assert_eq!(acc.content(), "AB");
    }

    #[test]
    fn test_action_required_does_not_end_stream() {
        let mut acc = accumulator();
        let step = acc.apply(chunk(json!({"type": "action_required", "decision_id": "d1"})));
        assert!(matches!(step, AssemblyStep::ActionRequired(ref r) if r.decision_id == "d1"));
        assert!(!acc.is_finished());
        assert_eq!(
            acc.apply(chunk(json!({"type": "response", "content": "more"}))),
            AssemblyStep::Content
        );
    }

    #[test]
    fn test_error_is_terminal() {
        let mut acc = accumulator();
        let step = acc.apply(chunk(json!({"type": "error", "message": "Model overloaded"})));
        assert_eq!(step, AssemblyStep::Failed("Model overloaded".to_string()));
        assert!(acc.is_finished());
        assert_eq!(
            acc.apply(chunk(json!({"type": "response", "content": "late"}))),
            AssemblyStep::Ignored
        );
        assert!(acc.content().is_empty());
    }

    #[test]
    fn test_render_keeps_streaming() {
        let mut acc = accumulator();
        acc.apply(chunk(json!({"type": "thinking", "percent": 15})));
        acc.apply(chunk(json!({"type": "response", "content": "Hi"})));
        let rendered = acc.render(&Message::placeholder());
        assert!(rendered.is_streaming());
        assert_eq!(rendered.content, "Hi");
        assert_eq!(rendered.metadata.progress_percent, Some(80));
        assert_eq!(rendered.metadata.progress.len(), 2);
    }

    #[test]
    fn test_finalize_freezes_and_merges() {
        let mut acc = accumulator();
        acc.apply(chunk(json!({"type": "response", "content": "Done"})));
        let step = acc.apply(chunk(json!({
            "type": "complete",
            "intent": "portfolio_query",
            "confidence": 0.93,
            "metadata": {"symbols": ["BTC"], "streaming": true}
        })));
        let AssemblyStep::Completed(completion) = step else {
            panic!("expected completion");
        };

        let placeholder = Message::placeholder();
        let finished = acc.finalize(&placeholder, &completion);
        assert_eq!(finished.id, placeholder.id);
        assert_eq!(finished.content, "Done");
        assert!(!finished.is_streaming());
        assert!(finished.metadata.progress.is_empty());
        assert_eq!(finished.metadata.progress_percent, None);
        assert_eq!(finished.intent.as_deref(), Some("portfolio_query"));
        assert_eq!(finished.confidence, Some(0.93));
        assert_eq!(finished.metadata.extra["symbols"], json!(["BTC"]));
    }

    #[test]
    fn test_finalize_uses_completion_content_when_nothing_streamed() {
        let acc = accumulator();
        let completion = Completion {
            content: Some("X".to_string()),
            ..Default::default()
        };
        let finished = acc.finalize(&Message::placeholder(), &completion);
        assert_eq!(finished.content, "X");
    }
}

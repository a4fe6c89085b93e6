use serde_json::Value;

use crate::error::ClientError;
use crate::services::protocol::ServerError;

pub const GENERIC_ERROR_MESSAGE: &str =
    "Sorry, I'm having trouble connecting right now. Please try again.";

pub const TIMEOUT_MESSAGE: &str = "The assistant took too long to respond. Please try again.";

/// Turn a transport failure into the one line shown in the transcript.
pub fn describe_error(error: &ClientError) -> String {
    error
        .payload()
        .and_then(describe_payload)
        .unwrap_or_else(|| GENERIC_ERROR_MESSAGE.to_string())
}

/// Same rule for an explicit `error` chunk
pub fn describe_server_error(error: &ServerError) -> String {
    error
        .detail
        .as_ref()
        .and_then(text_of)
        .or_else(|| error.message.clone().filter(|m| !m.trim().is_empty()))
        .or_else(|| error.error.as_ref().and_then(text_of))
        .unwrap_or_else(|| GENERIC_ERROR_MESSAGE.to_string())
}

/// Look for a human readable reason in a structured error body:
/// `detail`, then `message`, then `error`.
pub fn describe_payload(body: &Value) -> Option<String> {
    ["detail", "message", "error"]
        .iter()
        .find_map(|key| body.get(*key).and_then(text_of))
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        // FastAPI style validation errors: [{"msg": "..."}]
        Value::Array(items) => items.iter().find_map(|item| {
            item.get("msg")
                .or_else(|| item.get("message"))
                .and_then(text_of)
        }),
        Value::Object(_) => describe_payload(value),
        _ => None,
    }
}

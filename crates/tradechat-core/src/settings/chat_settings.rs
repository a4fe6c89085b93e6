use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/v1";
pub const DEFAULT_WELCOME_MESSAGE: &str = "Hi! I'm your trading assistant. Ask me about prices, your portfolio, or place a trade.";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub api_base_url: String,
    /// Push socket base URL; derived from `api_base_url` when unset
    pub ws_base_url: Option<String>,
    pub fallback_timeout_ms: u64,
    pub session_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Use the SSE stream as primary tier while the socket is down
    pub streaming_http: bool,
    pub welcome_message: String,
    pub cache_transcript: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            ws_base_url: None,
            fallback_timeout_ms: 8000,
            session_timeout_secs: 180,
            request_timeout_secs: 60,
            streaming_http: false,
            welcome_message: DEFAULT_WELCOME_MESSAGE.to_string(),
            cache_transcript: true,
            auth_token: None,
        }
    }
}

impl ChatSettings {
    pub fn api_base(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }

    /// Socket base URL: the explicit one, or the API URL with its scheme
    /// swapped to `ws`/`wss`.
    pub fn ws_base(&self) -> String {
        if let Some(url) = self.ws_base_url.as_deref().filter(|u| !u.is_empty()) {
            return url.trim_end_matches('/').to_string();
        }
        let api = self.api_base();
        if let Some(rest) = api.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = api.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            api.to_string()
        }
    }

    /// Push socket endpoint of one session
    pub fn socket_url(&self, session_id: &str) -> String {
        format!("{}/chat/ws/{}", self.ws_base(), session_id)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_derived_from_api_url() {
        let settings = ChatSettings::default();
        assert_eq!(settings.ws_base(), "ws://localhost:8000/api/v1");
        assert_eq!(
            settings.socket_url("abc"),
            "ws://localhost:8000/api/v1/chat/ws/abc"
        );

        let secure = ChatSettings {
            api_base_url: "https://trade.example.com/api/v1/".to_string(),
            ..Default::default()
        };
        assert_eq!(secure.ws_base(), "wss://trade.example.com/api/v1");
    }

    #[test]
    fn test_explicit_ws_url_wins() {
        let settings = ChatSettings {
            ws_base_url: Some("ws://push.local/".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.ws_base(), "ws://push.local");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: ChatSettings =
            serde_json::from_str(r#"{"fallback_timeout_ms": 2000, "streaming_http": true}"#).unwrap();
        assert_eq!(settings.fallback_timeout(), Duration::from_secs(2));
        assert!(settings.streaming_http);
        assert_eq!(settings.session_timeout_secs, 180);
        assert!(settings.cache_transcript);
    }
}

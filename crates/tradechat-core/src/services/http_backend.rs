use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::services::backend::{
    ChatBackend, ChunkStream, DecisionReply, DecisionRequest, FallbackReply, MessageRequest,
    SessionReply,
};
use crate::settings::ChatSettings;

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// [`ChatBackend`] over the REST and SSE endpoints of the chat API
pub struct HttpChatBackend {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    request_timeout: Duration,
}

impl HttpChatBackend {
    pub fn new(settings: &ChatSettings) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.api_base().to_string(),
            auth_token: settings.auth_token.clone(),
            request_timeout: settings.request_timeout(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self
            .authorized(self.client.post(self.url(path)))
            .timeout(self.request_timeout)
            .json(body);
        let response = request.send().await?;
        read_json(response).await
    }
}

/// Decode a JSON reply. Non-2xx statuses keep their body for error
/// formatting; a 2xx body with `success: false` is a rejection.
async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    let bytes = response.bytes().await?;

    if !status.is_success() {
        return Err(ClientError::Status {
            status: status.as_u16(),
            body: serde_json::from_slice(&bytes).ok(),
        });
    }

    let value: Value = serde_json::from_slice(&bytes)?;
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(ClientError::Rejected { body: value });
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn create_session(&self) -> Result<String, ClientError> {
        let reply: SessionReply = self
            .post_json("/chat/session/new", &serde_json::json!({}))
            .await?;
        debug!(session_id = %reply.session_id, "Created chat session");
        Ok(reply.session_id)
    }

    async fn send_message(&self, request: &MessageRequest) -> Result<FallbackReply, ClientError> {
        self.post_json("/chat/message", request).await
    }

    async fn resolve_decision(&self, request: &DecisionRequest) -> Result<DecisionReply, ClientError> {
        self.post_json("/chat/decision/approve", request).await
    }

    async fn open_stream(&self, request: &MessageRequest) -> Result<ChunkStream, ClientError> {
        let builder = self
            .authorized(self.client.get(self.url("/chat/stream")))
            .header("Accept", "text/event-stream")
            .query(&[
                ("session_id", request.session_id.as_str()),
                ("message", request.message.as_str()),
                ("request_id", request.request_id.as_str()),
            ]);

        let es = EventSource::new(builder).map_err(|e| ClientError::Stream(e.to_string()))?;
        let request_id = request.request_id.clone();

        let stream = async_stream::stream! {
            let mut es = es;
            while let Some(event) = es.next().await {
                match event {
                    Ok(Event::Open) => {
                        debug!(request_id = %request_id, "SSE stream opened");
                    }
                    Ok(Event::Message(msg)) => {
                        let data = msg.data.trim();
                        if data == "[DONE]" {
                            break;
                        }
                        match serde_json::from_str::<Value>(data) {
                            Ok(mut value) => {
                                // Named SSE events may carry the chunk type outside the data
                                if value.get("type").is_none() && !msg.event.is_empty() && msg.event != "message" {
                                    if let Some(object) = value.as_object_mut() {
                                        object.insert("type".to_string(), Value::String(msg.event.clone()));
                                    }
                                }
                                yield Ok(value);
                            }
                            Err(e) => {
                                warn!(request_id = %request_id, error = ?e, "Skipping undecodable SSE data");
                            }
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                        let body = response.json::<Value>().await.ok();
                        yield Err(ClientError::Status { status: status.as_u16(), body });
                        break;
                    }
                    Err(e) => {
                        yield Err(ClientError::Stream(e.to_string()));
                        break;
                    }
                }
            }
            es.close();
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend_for(server: &MockServer, token: Option<&str>) -> HttpChatBackend {
        let settings = ChatSettings {
            api_base_url: format!("{}/api/v1", server.uri()),
            auth_token: token.map(str::to_string),
            ..Default::default()
        };
        HttpChatBackend::new(&settings).unwrap()
    }

    fn message_request() -> MessageRequest {
        MessageRequest {
            message: "What is BTC at?".to_string(),
            session_id: "s1".to_string(),
            request_id: "r1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_session_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/session/new"))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session_id": "s42"})))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server, Some("t0k"));
        assert_eq!(backend.create_session().await.unwrap(), "s42");
    }

    #[tokio::test]
    async fn test_send_message_posts_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/message"))
            .and(body_json(json!({"message": "What is BTC at?", "session_id": "s1", "request_id": "r1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "message_id": "m1",
                "content": "About 64k",
                "intent": "price_check",
                "confidence": 0.9
            })))
            .mount(&server)
            .await;

        let reply = backend_for(&server, None)
            .send_message(&message_request())
            .await
            .unwrap();
        assert_eq!(reply.content, "About 64k");
        assert_eq!(reply.intent.as_deref(), Some("price_check"));
    }

    #[tokio::test]
    async fn test_error_status_keeps_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/message"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({"detail": "Model offline"})))
            .mount(&server)
            .await;

        let err = backend_for(&server, None)
            .send_message(&message_request())
            .await
            .unwrap_err();
        match err {
            ClientError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body.unwrap()["detail"], "Model offline");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_success_false_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/decision/approve"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": false, "message": "Decision expired"})),
            )
            .mount(&server)
            .await;

        let request = DecisionRequest {
            decision_id: "d1".to_string(),
            approved: true,
            modifications: None,
        };
        let err = backend_for(&server, None)
            .resolve_decision(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected { ref body } if body["message"] == "Decision expired"));
    }

    #[tokio::test]
    async fn test_open_stream_yields_chunks() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"type\":\"thinking\",\"percent\":10}\n\n",
            "event: response\n",
            "data: {\"content\":\"Hi\"}\n\n",
            "data: not json\n\n",
            "data: {\"type\":\"complete\"}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("GET"))
            .and(path("/api/v1/chat/stream"))
            .and(query_param("session_id", "s1"))
            .and(query_param("request_id", "r1"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let stream = backend_for(&server, None)
            .open_stream(&message_request())
            .await
            .unwrap();
        let chunks: Vec<Value> = stream.map(|item| item.unwrap()).collect().await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0]["type"], "thinking");
        assert_eq!(chunks[1], json!({"type": "response", "content": "Hi"}));
        assert_eq!(chunks[2]["type"], "complete");
    }

    #[tokio::test]
    async fn test_open_stream_reports_bad_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/chat/stream"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "Not Found"})))
            .mount(&server)
            .await;

        let mut stream = backend_for(&server, None)
            .open_stream(&message_request())
            .await
            .unwrap();
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(ClientError::Status { status: 404, .. })));
        assert!(stream.next().await.is_none());
    }
}

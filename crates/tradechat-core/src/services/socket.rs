use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::services::protocol::{ClientFrame, InboundFrame, decode_server_frame};

/// Push side of the chat API: a persistent bidirectional channel
#[async_trait]
pub trait PushChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Queue a frame for delivery. Fails when the channel is closed.
    async fn send(&self, frame: ClientFrame) -> Result<(), ClientError>;
}

/// WebSocket client for `/chat/ws/{session_id}`.
///
/// A writer task drains an outbound queue into the socket; a reader task
/// decodes `chat_response` frames into [`InboundFrame`]s. Both stop when the
/// socket closes, which also yields a final [`InboundFrame::Disconnected`].
pub struct SocketChannel {
    outbound: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SocketChannel {
    pub async fn connect(
        url: &str,
        auth_token: Option<&str>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundFrame>), ClientError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::Socket(e.to_string()))?;
        if let Some(token) = auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ClientError::Socket(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| ClientError::Socket(e.to_string()))?;
        info!(url = %url, "Push socket connected");

        let (mut sink, mut source) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let writer_connected = connected.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!(error = ?e, "Push socket write failed");
                    writer_connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_connected = connected.clone();
        let pong_tx = outbound.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => match decode_server_frame(text.as_str()) {
                        Ok(Some(frame)) => {
                            if inbound_tx.send(frame).is_err() {
                                break "receiver dropped".to_string();
                            }
                        }
                        Ok(None) => debug!("Ignoring non-chat socket frame"),
                        Err(e) => warn!(error = %e, "Skipping malformed socket frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = pong_tx.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = ?e, "Push socket read failed");
                        break e.to_string();
                    }
                    None => break "stream ended".to_string(),
                }
            };
            reader_connected.store(false, Ordering::SeqCst);
            info!(reason = %reason, "Push socket disconnected");
            let _ = inbound_tx.send(InboundFrame::Disconnected { reason });
        });

        Ok((
            Self {
                outbound,
                connected,
                reader,
                writer,
            },
            inbound_rx,
        ))
    }
}

#[async_trait]
impl PushChannel for SocketChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Socket("push socket is not connected".to_string()));
        }
        let json = serde_json::to_string(&frame)?;
        self.outbound
            .send(Message::Text(json.into()))
            .map_err(|_| ClientError::Socket("push socket writer stopped".to_string()))
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

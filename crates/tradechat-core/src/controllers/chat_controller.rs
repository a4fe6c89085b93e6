use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::fallback_supervisor::FallbackSupervisor;
use crate::error::{ChatError, ChatResult, ClientError};
use crate::models::decision_store::{DecisionStore, OfferOutcome, PendingDecision};
use crate::models::message::Message;
use crate::models::session::{SessionManager, TransportMode};
use crate::models::transcript_store::TranscriptStore;
use crate::repositories::{TranscriptData, TranscriptRepository};
use crate::services::backend::{ChatBackend, DecisionRequest, MessageRequest};
use crate::services::error_format::{GENERIC_ERROR_MESSAGE, TIMEOUT_MESSAGE, describe_error};
use crate::services::protocol::{ActionRequest, Chunk, ClientFrame, Completion, InboundFrame};
use crate::services::socket::{PushChannel, SocketChannel};
use crate::services::stream_assembler::{AssemblyStep, StreamAccumulator};
use crate::settings::ChatSettings;

pub const DECLINE_MESSAGE: &str = "Trade cancelled. No action was taken.";
const APPROVED_MESSAGE: &str = "Trade approved and submitted.";
const CONFIRMATION_PROMPT: &str = "Please confirm this trade before I proceed.";

/// Primary tiers. The fallback tier is not a channel: it never streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Socket,
    Stream,
}

impl Channel {
    fn mode(self) -> TransportMode {
        match self {
            Channel::Socket => TransportMode::Socket,
            Channel::Stream => TransportMode::Stream,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Sent on a primary channel, fallback timer armed
    AwaitingPrimary(Channel),
    /// The channel produced output and owns the request
    Streaming(Channel),
    /// Fallback call in flight
    Fallback,
}

/// Outcome of [`ChatController::resolve_decision`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecisionResolution {
    Approved,
    /// Approval was attempted but the backend refused or failed
    ApprovalFailed,
    Declined,
    /// The id was not the pending decision (already resolved, unknown or queued)
    NotPending,
}

/// State of the single in-flight request
struct ActiveRequest {
    session_id: String,
    text: String,
    phase: Phase,
    accumulator: StreamAccumulator,
    supervisor: FallbackSupervisor,
    deadline: Option<JoinHandle<()>>,
    stream_task: Option<JoinHandle<()>>,
}

impl ActiveRequest {
    fn request_id(&self) -> &str {
        self.accumulator.request_id()
    }

    fn message_request(&self) -> MessageRequest {
        MessageRequest {
            message: self.text.clone(),
            session_id: self.session_id.clone(),
            request_id: self.request_id().to_string(),
        }
    }

    /// Stop every timer and task owned by the request. Idempotent.
    fn release(&mut self) {
        self.supervisor.clear();
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
    }
}

struct ControllerInner {
    settings: ChatSettings,
    backend: Arc<dyn ChatBackend>,
    push: RwLock<Option<Arc<dyn PushChannel>>>,
    push_pump: Mutex<Option<JoinHandle<()>>>,
    /// Set once `connect_socket` was asked for; a new session reconnects
    socket_wanted: AtomicBool,
    session: SessionManager,
    store: TranscriptStore,
    decisions: DecisionStore,
    repository: Option<Arc<dyn TranscriptRepository>>,
    active: Mutex<Option<ActiveRequest>>,
    loading: watch::Sender<bool>,
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if let Some(pump) = self.push_pump.get_mut().take() {
            pump.abort();
        }
        if let Some(request) = self.active.get_mut().as_mut() {
            request.release();
        }
    }
}

/// Drives one conversation: picks a transport tier per message, feeds
/// chunks through the stream assembler into the transcript, supervises the
/// fallback and session timers, and resolves trade decisions.
///
/// Cloning is cheap and every clone drives the same conversation.
#[derive(Clone)]
pub struct ChatController {
    inner: Arc<ControllerInner>,
}

impl ChatController {
    pub fn new(
        settings: ChatSettings,
        backend: Arc<dyn ChatBackend>,
        repository: Option<Arc<dyn TranscriptRepository>>,
    ) -> Self {
        let (loading, _) = watch::channel(false);
        let session = SessionManager::new(settings.welcome_message.clone());
        Self {
            inner: Arc::new(ControllerInner {
                settings,
                backend,
                push: RwLock::new(None),
                push_pump: Mutex::new(None),
                socket_wanted: AtomicBool::new(false),
                session,
                store: TranscriptStore::new(),
                decisions: DecisionStore::new(),
                repository,
                active: Mutex::new(None),
                loading,
            }),
        }
    }

    fn downgrade(&self) -> Weak<ControllerInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<ControllerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn store(&self) -> &TranscriptStore {
        &self.inner.store
    }

    pub fn decisions(&self) -> &DecisionStore {
        &self.inner.decisions
    }

    pub fn session(&self) -> &SessionManager {
        &self.inner.session
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.inner.settings
    }

    pub fn pending_decision(&self) -> Option<PendingDecision> {
        self.inner.decisions.pending()
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.inner.session.mode()
    }

    pub fn is_loading(&self) -> bool {
        *self.inner.loading.borrow()
    }

    /// Resolve once no request is in flight
    pub async fn wait_idle(&self) {
        let mut loading = self.inner.loading.subscribe();
        let _ = loading.wait_for(|busy| !*busy).await;
    }

    fn set_loading(&self, busy: bool) {
        self.inner.loading.send_replace(busy);
    }

    pub async fn ensure_session(&self) -> ChatResult<String> {
        self.inner
            .session
            .ensure_session(self.inner.backend.as_ref(), &self.inner.store)
            .await
    }

    // ---- push channel ----

    /// Use `channel` as the push tier. Frames from `frames` are fed into the
    /// conversation until the receiver closes or another channel is attached.
    pub fn attach_push_channel(
        &self,
        channel: Arc<dyn PushChannel>,
        mut frames: mpsc::UnboundedReceiver<InboundFrame>,
    ) {
        *self.inner.push.write() = Some(channel);

        let weak = self.downgrade();
        let pump = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let Some(controller) = ChatController::upgrade(&weak) else {
                    break;
                };
                controller.handle_inbound(frame);
            }
        });
        if let Some(previous) = self.inner.push_pump.lock().replace(pump) {
            previous.abort();
        }
    }

    /// Drop the push tier. Its socket is bound to the session it was opened for.
    fn detach_push_channel(&self) {
        if self.inner.push.write().take().is_some() {
            debug!("Push channel detached");
        }
        if let Some(pump) = self.inner.push_pump.lock().take() {
            pump.abort();
        }
    }

    /// Open the push socket of the current session. A failed connect is not
    /// an error: messages then go straight to the next tier. Once called,
    /// the socket is reopened for every new session.
    pub async fn connect_socket(&self) -> ChatResult<bool> {
        self.inner.socket_wanted.store(true, Ordering::SeqCst);
        let session_id = self.ensure_session().await?;
        let url = self.inner.settings.socket_url(&session_id);
        match SocketChannel::connect(&url, self.inner.settings.auth_token.as_deref()).await {
            Ok((channel, frames)) => {
                self.attach_push_channel(Arc::new(channel), frames);
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, url = %url, "Push socket unavailable, continuing without it");
                Ok(false)
            }
        }
    }

    pub fn handle_inbound(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Chunk {
                request_id,
                payload,
            } => self.handle_chunk(Channel::Socket, request_id.as_deref(), &payload),
            InboundFrame::Disconnected { reason } => {
                self.on_primary_failed(Channel::Socket, None, ClientError::Socket(reason));
            }
        }
    }

    // ---- sending ----

    /// Send a user message. Returns the request id once the message is in
    /// the transcript and dispatched; the reply arrives asynchronously.
    pub async fn send(&self, text: &str) -> ChatResult<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if self.is_loading() {
            return Err(ChatError::RequestInFlight);
        }

        let session_id = self.ensure_session().await?;
        if self.inner.socket_wanted.load(Ordering::SeqCst) && self.inner.push.read().is_none() {
            self.connect_socket().await?;
        }
        let push = self
            .inner
            .push
            .read()
            .clone()
            .filter(|channel| channel.is_connected());
        let primary = if push.is_some() {
            Some(Channel::Socket)
        } else if self.inner.settings.streaming_http {
            Some(Channel::Stream)
        } else {
            None
        };

        let request_id = Uuid::new_v4().to_string();
        let message_request = {
            let mut active = self.inner.active.lock();
            if active.is_some() {
                return Err(ChatError::RequestInFlight);
            }

            let user = Message::user(text);
            let placeholder = Message::placeholder();
            let placeholder_id = placeholder.id.clone();
            self.inner.store.append(user);
            self.inner.store.append(placeholder);

            let mut request = ActiveRequest {
                session_id,
                text: text.to_string(),
                phase: primary.map_or(Phase::Fallback, Phase::AwaitingPrimary),
                accumulator: StreamAccumulator::new(request_id.clone(), placeholder_id),
                supervisor: FallbackSupervisor::new(),
                deadline: None,
                stream_task: None,
            };

            if primary.is_some() {
                let weak = self.downgrade();
                let id = request_id.clone();
                request
                    .supervisor
                    .arm(self.inner.settings.fallback_timeout(), async move {
                        if let Some(controller) = ChatController::upgrade(&weak) {
                            controller.on_fallback_timer(&id).await;
                        }
                    });
            }

            let weak = self.downgrade();
            let id = request_id.clone();
            let session_timeout = self.inner.settings.session_timeout();
            request.deadline = Some(tokio::spawn(async move {
                tokio::time::sleep(session_timeout).await;
                if let Some(controller) = ChatController::upgrade(&weak) {
                    controller.on_session_timeout(&id);
                }
            }));

            let message_request = request.message_request();
            if primary == Some(Channel::Stream) {
                let controller = self.clone();
                let stream_request = message_request.clone();
                request.stream_task = Some(tokio::spawn(async move {
                    controller.drive_stream(stream_request).await;
                }));
            }

            *active = Some(request);
            self.set_loading(true);
            self.inner
                .session
                .set_mode(primary.map_or(TransportMode::Fallback, Channel::mode));
            message_request
        };

        info!(request_id = %request_id, transport = %self.inner.session.mode(), "Sending message");

        match (primary, push) {
            (Some(Channel::Socket), Some(push)) => {
                let frame = ClientFrame::ChatMessage {
                    message: message_request.message,
                    session_id: message_request.session_id,
                    request_id: request_id.clone(),
                };
                if let Err(e) = push.send(frame).await {
                    self.on_primary_failed(Channel::Socket, Some(&request_id), e);
                }
            }
            (Some(Channel::Stream), _) => {}
            _ => {
                let controller = self.clone();
                tokio::spawn(async move {
                    controller.run_fallback(message_request).await;
                });
            }
        }

        Ok(request_id)
    }

    async fn drive_stream(&self, request: MessageRequest) {
        let request_id = request.request_id.clone();
        let mut stream = match self.inner.backend.open_stream(&request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.on_primary_failed(Channel::Stream, Some(&request_id), e);
                return;
            }
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(payload) => self.handle_chunk(Channel::Stream, Some(&request_id), &payload),
                Err(e) => {
                    self.on_primary_failed(Channel::Stream, Some(&request_id), e);
                    return;
                }
            }
        }

        self.on_primary_failed(
            Channel::Stream,
            Some(&request_id),
            ClientError::Stream("stream ended before completion".to_string()),
        );
    }

    async fn run_fallback(&self, request: MessageRequest) {
        debug!(request_id = %request.request_id, "Calling fallback endpoint");
        let result = self.inner.backend.send_message(&request).await;

        let mut active = self.inner.active.lock();
        let matches = active
            .as_ref()
            .is_some_and(|r| r.request_id() == request.request_id && r.phase == Phase::Fallback);
        if !matches {
            debug!(request_id = %request.request_id, "Fallback reply for inactive request ignored");
            return;
        }
        let Some(finished) = active.take() else {
            return;
        };
        drop(active);

        match result {
            Ok(reply) => self.complete_request(finished, Completion::from(reply)),
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "Fallback request failed");
                self.fail_request(finished, describe_error(&e), "connection");
            }
        }
    }

    // ---- timers ----

    async fn on_fallback_timer(&self, request_id: &str) {
        let request = {
            let mut active = self.inner.active.lock();
            let Some(request) = active.as_mut().filter(|r| r.request_id() == request_id) else {
                return;
            };
            if !matches!(request.phase, Phase::AwaitingPrimary(_)) || !request.supervisor.fire() {
                return;
            }
            info!(request_id = %request_id, "No primary output in time, switching to fallback");
            request.phase = Phase::Fallback;
            if let Some(task) = request.stream_task.take() {
                task.abort();
            }
            self.inner.session.set_mode(TransportMode::Fallback);
            request.message_request()
        };
        self.run_fallback(request).await;
    }

    fn on_session_timeout(&self, request_id: &str) {
        let finished = {
            let mut active = self.inner.active.lock();
            if active.as_ref().is_none_or(|r| r.request_id() != request_id) {
                return;
            }
            active.take()
        };
        if let Some(finished) = finished {
            warn!(request_id = %request_id, "Request timed out without a terminal chunk");
            self.fail_request(finished, TIMEOUT_MESSAGE.to_string(), "timeout");
        }
    }

    // ---- primary channel events ----

    /// A primary channel broke. Before any output the request moves on to
    /// the fallback tier; after output the request fails.
    fn on_primary_failed(&self, channel: Channel, request_id: Option<&str>, error: ClientError) {
        let mut active = self.inner.active.lock();
        let Some(request) = active.as_mut() else {
            return;
        };
        if request_id.is_some_and(|id| id != request.request_id()) {
            return;
        }

        let phase = request.phase;
        match phase {
            Phase::AwaitingPrimary(expected) if expected == channel => {
                warn!(request_id = %request.request_id(), ?channel, error = %error, "Primary channel failed, using fallback");
                request.supervisor.clear();
                request.phase = Phase::Fallback;
                // Detach: the failing stream task is the caller or already done
                request.stream_task = None;
                self.inner.session.set_mode(TransportMode::Fallback);

                let message_request = request.message_request();
                drop(active);
                let controller = self.clone();
                tokio::spawn(async move {
                    controller.run_fallback(message_request).await;
                });
            }
            Phase::Streaming(bound) if bound == channel => {
                warn!(request_id = %request.request_id(), ?channel, error = %error, "Primary channel failed mid-stream");
                if let Some(finished) = active.take() {
                    drop(active);
                    self.fail_request(finished, describe_error(&error), "connection");
                }
            }
            _ => {
                debug!(?channel, error = %error, "Channel failure does not affect the active request");
            }
        }
    }

    /// Feed one chunk of `channel` into the active request
    pub(crate) fn handle_chunk(&self, channel: Channel, request_id: Option<&str>, payload: &Value) {
        let chunk = match Chunk::parse(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(?channel, error = %e, "Skipping malformed chunk");
                return;
            }
        };

        let mut active = self.inner.active.lock();
        let Some(request) = active.as_mut() else {
            debug!(?channel, kind = chunk.kind(), "Chunk without an active request ignored");
            return;
        };
        if let Some(id) = request_id
            && id != request.request_id()
        {
            debug!(request_id = %id, active = %request.request_id(), "Chunk for another request ignored");
            return;
        }

        let phase = request.phase;
        match phase {
            Phase::AwaitingPrimary(expected) if expected == channel => {
                request.supervisor.clear();
                request.phase = Phase::Streaming(channel);
                debug!(request_id = %request.request_id(), ?channel, "Primary output received, fallback cancelled");
            }
            Phase::Streaming(bound) if bound == channel => {}
            phase => {
                debug!(request_id = %request.request_id(), ?channel, ?phase, "Chunk from inactive channel ignored");
                return;
            }
        }

        match request.accumulator.apply(chunk) {
            AssemblyStep::Ignored => {}
            AssemblyStep::Progress | AssemblyStep::Content => {
                let accumulator = &request.accumulator;
                self.inner
                    .store
                    .replace(accumulator.placeholder_id(), |current| accumulator.render(current));
            }
            AssemblyStep::ActionRequired(action) => {
                self.post_action_request(&action);
            }
            AssemblyStep::Failed(text) => {
                if let Some(finished) = active.take() {
                    drop(active);
                    self.fail_request(finished, text, "server");
                }
            }
            AssemblyStep::Completed(completion) => {
                if let Some(finished) = active.take() {
                    drop(active);
                    self.complete_request(finished, completion);
                }
            }
        }
    }

    // ---- terminal transitions ----

    fn complete_request(&self, mut request: ActiveRequest, completion: Completion) {
        request.release();
        let placeholder_id = request.accumulator.placeholder_id().to_string();

        let mut finalized = None;
        let replaced = self.inner.store.replace(&placeholder_id, |current| {
            let message = request.accumulator.finalize(current, &completion);
            finalized = Some(message.clone());
            message
        });
        if !replaced {
            warn!(request_id = %request.request_id(), "Placeholder vanished before completion");
        }

        if let (Some(decision_id), Some(message)) = (completion.approval_decision_id(), finalized) {
            self.offer_decision(decision_id, message);
        }

        info!(request_id = %request.request_id(), chunks = request.accumulator.chunk_count(), "Response complete");
        self.finish(request);
    }

    fn fail_request(&self, mut request: ActiveRequest, text: String, kind: &str) {
        request.release();
        self.inner.store.remove(request.accumulator.placeholder_id());
        self.inner
            .store
            .append(Message::system(text).with_extra("error_kind", kind));
        self.finish(request);
    }

    fn finish(&self, request: ActiveRequest) {
        debug!(request_id = %request.request_id(), "Request finished");
        self.inner.session.set_mode(TransportMode::Idle);
        self.set_loading(false);
        self.save_transcript();
    }

    // ---- decisions ----

    fn post_action_request(&self, action: &ActionRequest) {
        let content = action
            .message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| CONFIRMATION_PROMPT.to_string());
        let mut message = Message::system(content).with_extra("requires_approval", true);
        message.metadata.decision_id = Some(action.decision_id.clone());
        message.metadata.action = action.action.clone();
        if let Some(risk) = &action.risk_level {
            message = message.with_extra("risk_level", risk.clone());
        }

        if self.offer_decision(&action.decision_id, message.clone()) {
            self.inner.store.append(message);
        }
    }

    /// Register a decision. Returns false when the id was already known.
    fn offer_decision(&self, decision_id: &str, message: Message) -> bool {
        match self
            .inner
            .decisions
            .offer(PendingDecision::new(decision_id, message))
        {
            OfferOutcome::Pending => {
                info!(decision_id = %decision_id, "Trade decision pending");
                true
            }
            OfferOutcome::Queued { position } => {
                info!(decision_id = %decision_id, position, "Trade decision queued behind the pending one");
                true
            }
            OfferOutcome::Ignored => {
                debug!(decision_id = %decision_id, "Duplicate trade decision ignored");
                false
            }
        }
    }

    /// Approve or decline the pending decision `decision_id`.
    ///
    /// The pending record is cleared before the backend is called, so it is
    /// cleared exactly once whatever the call does; repeated calls return
    /// [`DecisionResolution::NotPending`].
    pub async fn resolve_decision(&self, decision_id: &str, approved: bool) -> DecisionResolution {
        let Some(decision) = self.inner.decisions.take_if_pending(decision_id) else {
            debug!(decision_id = %decision_id, "No pending decision with this id");
            return DecisionResolution::NotPending;
        };

        let request = DecisionRequest {
            decision_id: decision.id.clone(),
            approved,
            modifications: None,
        };
        let result = self.inner.backend.resolve_decision(&request).await;

        let (mut message, resolution) = if approved {
            match result {
                Ok(reply) if reply.success => {
                    let mut message = Message::assistant(
                        reply.message.unwrap_or_else(|| APPROVED_MESSAGE.to_string()),
                    );
                    if let Some(execution) = reply.execution_result {
                        message = message.with_extra("execution_result", execution);
                    }
                    (message, DecisionResolution::Approved)
                }
                Ok(reply) => {
                    warn!(decision_id = %decision.id, "Trade approval refused");
                    let text = reply
                        .message
                        .unwrap_or_else(|| GENERIC_ERROR_MESSAGE.to_string());
                    (
                        Message::system(text).with_extra("error_kind", "decision"),
                        DecisionResolution::ApprovalFailed,
                    )
                }
                Err(e) => {
                    warn!(decision_id = %decision.id, error = %e, "Trade approval failed");
                    (
                        Message::system(describe_error(&e)).with_extra("error_kind", "decision"),
                        DecisionResolution::ApprovalFailed,
                    )
                }
            }
        } else {
            if let Err(e) = &result {
                warn!(decision_id = %decision.id, error = %e, "Decline call failed, decision cleared anyway");
            }
            (Message::system(DECLINE_MESSAGE), DecisionResolution::Declined)
        };

        message.metadata.decision_id = Some(decision.id.clone());
        self.inner.store.append(message);
        self.save_transcript();
        resolution
    }

    pub async fn approve(&self, decision_id: &str) -> DecisionResolution {
        self.resolve_decision(decision_id, true).await
    }

    pub async fn decline(&self, decision_id: &str) -> DecisionResolution {
        self.resolve_decision(decision_id, false).await
    }

    // ---- conversation lifecycle ----

    /// Cancel the active request and start over with an empty transcript
    /// and no session.
    pub async fn clear_conversation(&self) {
        let cancelled = self.inner.active.lock().take();
        if let Some(mut request) = cancelled {
            info!(request_id = %request.request_id(), "Cancelling active request");
            request.release();
        }

        let session_id = self.inner.session.session_id();
        self.detach_push_channel();
        self.inner.decisions.clear();
        self.inner.store.clear();
        self.inner.session.reset();
        self.set_loading(false);

        if let (Some(repository), Some(session_id)) = (&self.inner.repository, session_id)
            && let Err(e) = repository.clear(&session_id).await
        {
            warn!(session_id = %session_id, error = %e, "Failed to clear cached transcript");
        }
    }

    /// Resume `session_id`, loading its cached transcript if there is one.
    /// Returns whether a cached transcript was found.
    pub async fn restore(&self, session_id: &str) -> ChatResult<bool> {
        let repository = self
            .inner
            .repository
            .clone()
            .ok_or(ChatError::NoRepository)?;
        let data = repository.load(session_id).await?;
        self.inner.session.resume(session_id);

        let Some(data) = data else {
            return Ok(false);
        };
        // A reply that was streaming when the cache was written can never finish
        let messages: Vec<Message> = data
            .messages
            .into_iter()
            .filter(|m| !m.is_streaming())
            .collect();
        info!(session_id = %session_id, messages = messages.len(), "Restored cached transcript");
        self.inner.store.load(messages);
        Ok(true)
    }

    fn save_transcript(&self) {
        if !self.inner.settings.cache_transcript {
            return;
        }
        let (Some(repository), Some(session_id)) =
            (self.inner.repository.clone(), self.inner.session.session_id())
        else {
            return;
        };
        let messages = self.inner.store.all().as_ref().clone();
        tokio::spawn(async move {
            if let Err(e) = repository
                .save(TranscriptData::new(session_id.clone(), messages))
                .await
            {
                warn!(session_id = %session_id, error = %e, "Failed to cache transcript");
            }
        });
    }
}

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use murmur_storage::{
    ConversationId, ConversationStore, GenerationPointerStore, MessageId, StorageError,
};
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::display::{DEFAULT_CHAR_DELAY, DisplayFeed, display_channel, load_saved_content};
use crate::event::StreamEvent;
use crate::frame::{FrameError, FrameReader};
use crate::phase::SessionPhase;
use crate::retry::{FailureKind, RetryPolicy};
use crate::side_channel::{SideChannels, StatusUpdate};
use crate::transport::{GenerationTransport, TransportError, TransportResponse};
use crate::ui::{UiEvent, UiFlags, UiNotifier};

pub const DEFAULT_SKELETON_DELAY: Duration = Duration::from_millis(400);

const FRESH_RESPONSE_ENDPOINT: &str = "completion response";

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("generation stream at {endpoint} is not available yet (status {status})"))]
    NotReady {
        stage: &'static str,
        endpoint: String,
        status: u16,
    },
    #[snafu(display(
        "generation stream at {endpoint} timed out; processing continues server-side and can be resumed later"
    ))]
    Timeout {
        stage: &'static str,
        endpoint: String,
    },
    #[snafu(display("generation stream at {endpoint} returned status {status}"))]
    ConnectionStatus {
        stage: &'static str,
        endpoint: String,
        status: u16,
    },
    #[snafu(display("failed to reach {endpoint} on `{stage}`, {source}"))]
    Connect {
        stage: &'static str,
        endpoint: String,
        source: TransportError,
    },
    #[snafu(display("gave up on {endpoint} after {attempts} attempts, {source}"))]
    RetriesExhausted {
        stage: &'static str,
        endpoint: String,
        attempts: u32,
        source: Box<SessionError>,
    },
    #[snafu(display("generation failed: {message}"))]
    Protocol {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("failed to consume generation stream on `{stage}`, {source}"))]
    Stream {
        stage: &'static str,
        source: FrameError,
    },
    #[snafu(display("failed to persist streamed content on `{stage}`, {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
}

impl SessionError {
    /// Whether stream acquisition may re-issue the request after this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::NotReady { .. } | Self::ConnectionStatus { .. } | Self::Connect { .. } => {
                FailureKind::Retryable
            }
            Self::Timeout { .. }
            | Self::RetriesExhausted { .. }
            | Self::Protocol { .. }
            | Self::Stream { .. }
            | Self::Store { .. } => FailureKind::Terminal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

struct AcquireFailure {
    kind: FailureKind,
    error: SessionError,
}

impl From<SessionError> for AcquireFailure {
    fn from(error: SessionError) -> Self {
        Self {
            kind: error.failure_kind(),
            error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub retry: RetryPolicy,
    pub char_delay: Duration,
    pub skeleton_delay: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            char_delay: DEFAULT_CHAR_DELAY,
            skeleton_delay: DEFAULT_SKELETON_DELAY,
        }
    }
}

/// Where a session gets its body from.
#[derive(Debug)]
pub enum StreamSource {
    /// A response that is already open. It cannot be re-issued, so it is never retried.
    Open(TransportResponse),
    Reconnect { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub content: String,
    pub message_added: bool,
    /// True when the server sent `complete`; false when the body simply ended.
    pub completed: bool,
    pub thinking: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Completed(SessionSummary),
    AlreadyAttached,
}

struct SessionHandle {
    conversation_id: ConversationId,
    phase: Arc<Mutex<SessionPhase>>,
}

struct ControllerInner {
    transport: Arc<dyn GenerationTransport>,
    conversations: Arc<dyn ConversationStore>,
    pointers: Arc<dyn GenerationPointerStore>,
    config: StreamConfig,
    active: Mutex<HashMap<MessageId, SessionHandle>>,
    flags: watch::Sender<UiFlags>,
    side_channels: SideChannels,
    notifier: UiNotifier,
}

/// Attaches generation streams to messages, one session per message id.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(
        transport: Arc<dyn GenerationTransport>,
        conversations: Arc<dyn ConversationStore>,
        pointers: Arc<dyn GenerationPointerStore>,
        config: StreamConfig,
        notifier: UiNotifier,
    ) -> Self {
        let (flags, _) = watch::channel(UiFlags::default());
        Self {
            inner: Arc::new(ControllerInner {
                transport,
                conversations,
                pointers,
                config,
                active: Mutex::new(HashMap::new()),
                flags,
                side_channels: SideChannels::default(),
                notifier,
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn GenerationTransport> {
        &self.inner.transport
    }

    pub fn conversations(&self) -> &Arc<dyn ConversationStore> {
        &self.inner.conversations
    }

    pub fn pointers(&self) -> &Arc<dyn GenerationPointerStore> {
        &self.inner.pointers
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn side_channels(&self) -> &SideChannels {
        &self.inner.side_channels
    }

    pub fn flags(&self) -> UiFlags {
        self.inner.flags.borrow().clone()
    }

    pub fn subscribe_flags(&self) -> watch::Receiver<UiFlags> {
        self.inner.flags.subscribe()
    }

    pub fn is_attached(&self, message_id: &MessageId) -> bool {
        self.inner.active.lock().contains_key(message_id)
    }

    pub fn phase(&self, message_id: &MessageId) -> Option<SessionPhase> {
        self.inner
            .active
            .lock()
            .get(message_id)
            .map(|handle| *handle.phase.lock())
    }

    /// Conversations that currently have a session attached.
    pub fn streaming_conversations(&self) -> Vec<ConversationId> {
        self.inner
            .active
            .lock()
            .values()
            .map(|handle| handle.conversation_id.clone())
            .collect()
    }

    /// Runs one generation session to completion.
    ///
    /// Returns [`AttachOutcome::AlreadyAttached`] without side effects when a session for
    /// `message_id` is already running. Every other exit path, including dropping the
    /// returned future, finalizes the session.
    pub async fn attach_stream(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        source: StreamSource,
    ) -> SessionResult<AttachOutcome> {
        let Some(mut guard) = self.claim(&conversation_id, &message_id) else {
            tracing::debug!(
                message_id = %message_id,
                "session already attached; ignoring duplicate attach"
            );
            return Ok(AttachOutcome::AlreadyAttached);
        };

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            "generation session started"
        );
        let result = self.run_session(&guard, source).await;
        match &result {
            Ok(summary) => tracing::info!(
                message_id = %message_id,
                chars = summary.content.chars().count(),
                completed = summary.completed,
                "generation session finished"
            ),
            Err(error) => tracing::error!(
                message_id = %message_id,
                error = %error,
                "generation session aborted"
            ),
        }

        guard.finalize();
        result.map(AttachOutcome::Completed)
    }

    fn claim(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Option<SessionGuard> {
        let phase = Arc::new(Mutex::new(SessionPhase::Idle));
        match self.inner.active.lock().entry(message_id.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(SessionHandle {
                    conversation_id: conversation_id.clone(),
                    phase: phase.clone(),
                });
            }
        }

        self.inner.side_channels.clear_status(message_id);
        self.inner.flags.send_modify(|flags| {
            flags.loading = true;
            flags.streaming = true;
            flags.status = None;
            flags.current_message_id = Some(message_id.clone());
        });
        self.inner.notifier.emit(UiEvent::SessionStarted {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
        });

        Some(SessionGuard {
            inner: self.inner.clone(),
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            phase,
            started_at: Instant::now(),
            finalized: false,
        })
    }

    async fn run_session(
        &self,
        guard: &SessionGuard,
        source: StreamSource,
    ) -> SessionResult<SessionSummary> {
        let inner = &self.inner;
        guard.advance(SessionPhase::Connecting);
        let response = self.acquire(&guard.message_id, source).await?;
        guard.advance(SessionPhase::AwaitingFirstContent);

        let saved = load_saved_content(
            inner.conversations.clone(),
            guard.conversation_id.clone(),
            guard.message_id.clone(),
        )
        .await
        .context(StoreSnafu {
            stage: "session-load-saved",
        })?;
        let replay = saved.clone().filter(|content| !content.is_empty());
        let (feed, scheduler) = display_channel(
            inner.conversations.clone(),
            guard.conversation_id.clone(),
            guard.message_id.clone(),
            inner.config.char_delay,
            inner.notifier.clone(),
            saved,
        );
        let (gate_tx, gate_rx) = watch::channel(false);
        let (trigger_tx, trigger_rx) = oneshot::channel();

        let reader = self.read_events(guard, response, feed, trigger_tx, replay);
        let skeleton = self.open_gate(guard, trigger_rx, gate_tx);
        let drain = async {
            scheduler.run(gate_rx).await.context(StoreSnafu {
                stage: "session-drain",
            })
        };

        let (completed, (), display) = tokio::try_join!(reader, skeleton, drain)?;

        Ok(SessionSummary {
            conversation_id: guard.conversation_id.clone(),
            message_id: guard.message_id.clone(),
            content: display.displayed_content,
            message_added: display.message_added,
            completed,
            thinking: inner.side_channels.thinking(&guard.message_id),
        })
    }

    async fn acquire(
        &self,
        message_id: &MessageId,
        source: StreamSource,
    ) -> SessionResult<TransportResponse> {
        match source {
            StreamSource::Open(response) => classify_response(FRESH_RESPONSE_ENDPOINT, response),
            StreamSource::Reconnect { url } => self.acquire_with_retry(message_id, &url).await,
        }
    }

    async fn acquire_with_retry(
        &self,
        message_id: &MessageId,
        url: &str,
    ) -> SessionResult<TransportResponse> {
        let policy = self.inner.config.retry;
        let mut retries = 0;

        loop {
            let attempt = match self.inner.transport.get(url).await {
                Ok(response) => classify_response(url, response),
                Err(source) => Err(SessionError::Connect {
                    stage: "session-acquire",
                    endpoint: url.to_string(),
                    source,
                }),
            };
            let failure = match attempt {
                Ok(response) => return Ok(response),
                Err(error) => AcquireFailure::from(error),
            };

            match failure.kind {
                FailureKind::Terminal => return Err(failure.error),
                FailureKind::Retryable if policy.allows_retry(retries) => {
                    let delay = policy.delay_for(retries);
                    retries += 1;
                    tracing::warn!(
                        message_id = %message_id,
                        url = %url,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.error,
                        "stream acquisition failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                FailureKind::Retryable => {
                    return Err(SessionError::RetriesExhausted {
                        stage: "session-acquire-retry",
                        endpoint: url.to_string(),
                        attempts: retries + 1,
                        source: Box::new(failure.error),
                    });
                }
            }
        }
    }

    async fn read_events(
        &self,
        guard: &SessionGuard,
        response: TransportResponse,
        feed: DisplayFeed,
        trigger: oneshot::Sender<()>,
        mut replay: Option<String>,
    ) -> SessionResult<bool> {
        let mut reader = FrameReader::new(response.body);
        let mut trigger = Some(trigger);
        let mut completed = false;

        while let Some(event) = reader.next_event().await.context(StreamSnafu {
            stage: "session-read-event",
        })? {
            tracing::debug!(
                message_id = %guard.message_id,
                event = event.kind(),
                "stream event received"
            );
            if self
                .dispatch(guard, &feed, &mut trigger, &mut replay, event)?
                .is_break()
            {
                completed = true;
                break;
            }
        }

        // Closing the feed lets the drain finish; dropping an unfired trigger opens the gate.
        drop(feed);
        drop(trigger);
        guard.advance(SessionPhase::Draining);
        Ok(completed)
    }

    fn dispatch(
        &self,
        guard: &SessionGuard,
        feed: &DisplayFeed,
        trigger: &mut Option<oneshot::Sender<()>>,
        replay: &mut Option<String>,
        event: StreamEvent,
    ) -> SessionResult<ControlFlow<()>> {
        let message_id = &guard.message_id;
        match event {
            StreamEvent::Init {
                message_id: announced,
                existing_content,
            } => {
                if let Some(announced) = announced.filter(|announced| announced != message_id) {
                    tracing::warn!(
                        message_id = %message_id,
                        announced = %announced,
                        "init announced a different message id"
                    );
                }
                if let Some(existing) = existing_content.filter(|content| !content.is_empty()) {
                    // The server's copy supersedes what this client saved locally.
                    *replay = None;
                    let queued = feed.push_str(&existing);
                    tracing::info!(
                        message_id = %message_id,
                        queued,
                        "replaying content generated before reconnect"
                    );
                    fire(trigger);
                }
            }
            StreamEvent::Status {
                action,
                description,
            } => self.update_status(message_id, StatusUpdate::progress(action, description)),
            StreamEvent::ToolStatus { action, status } => {
                self.update_status(message_id, StatusUpdate::tool(action, status));
            }
            StreamEvent::ThinkingChunk { content } => {
                self.append_thinking(message_id, &content);
                fire(trigger);
            }
            StreamEvent::Thinking { content } => self.append_thinking(message_id, &content),
            StreamEvent::Content { content } => {
                // New content continues after the saved partial when init did not replay it.
                if let Some(saved) = replay.take() {
                    let queued = feed.push_str(&saved);
                    tracing::info!(
                        message_id = %message_id,
                        queued,
                        "replaying locally saved content before new output"
                    );
                }
                feed.push_str(&content);
                fire(trigger);
            }
            StreamEvent::Complete {} => {
                if let Some(saved) = replay.take() {
                    feed.push_str(&saved);
                }
                return Ok(ControlFlow::Break(()));
            }
            StreamEvent::Error { error } => {
                return ProtocolSnafu {
                    stage: "session-dispatch",
                    message: error,
                }
                .fail();
            }
            StreamEvent::Unknown => {}
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Opens the display gate after the skeleton delay, or at once if nothing triggered it.
    async fn open_gate(
        &self,
        guard: &SessionGuard,
        trigger: oneshot::Receiver<()>,
        gate: watch::Sender<bool>,
    ) -> SessionResult<()> {
        if trigger.await.is_ok() {
            tokio::time::sleep(self.inner.config.skeleton_delay).await;
            if guard.current_phase() == SessionPhase::AwaitingFirstContent {
                guard.advance(SessionPhase::Displaying);
            }
        } else {
            tracing::debug!(
                message_id = %guard.message_id,
                "stream ended before first content; opening display gate"
            );
        }

        gate.send_replace(true);
        self.inner.flags.send_modify(|flags| flags.loading = false);
        Ok(())
    }

    fn update_status(&self, message_id: &MessageId, status: StatusUpdate) {
        self.inner.side_channels.set_status(message_id, status.clone());
        self.inner.flags.send_if_modified(|flags| {
            if flags.current_message_id.as_ref() != Some(message_id) {
                return false;
            }
            flags.status = Some(status.clone());
            true
        });
        self.inner.notifier.emit(UiEvent::StatusChanged {
            message_id: message_id.clone(),
            status: Some(status),
        });
    }

    fn append_thinking(&self, message_id: &MessageId, chunk: &str) {
        let thinking = self.inner.side_channels.append_thinking(message_id, chunk);
        self.inner.notifier.emit(UiEvent::ThinkingUpdated {
            message_id: message_id.clone(),
            thinking,
        });
    }
}

fn fire(trigger: &mut Option<oneshot::Sender<()>>) {
    if let Some(trigger) = trigger.take() {
        let _ = trigger.send(());
    }
}

fn classify_response(
    endpoint: &str,
    response: TransportResponse,
) -> SessionResult<TransportResponse> {
    match response.status {
        _ if response.is_success() => Ok(response),
        404 => NotReadySnafu {
            stage: "session-classify",
            endpoint,
            status: 404_u16,
        }
        .fail(),
        504 => TimeoutSnafu {
            stage: "session-classify",
            endpoint,
        }
        .fail(),
        status => ConnectionStatusSnafu {
            stage: "session-classify",
            endpoint,
            status,
        }
        .fail(),
    }
}

/// Owns a claimed message id; finalizes the session when dropped.
struct SessionGuard {
    inner: Arc<ControllerInner>,
    conversation_id: ConversationId,
    message_id: MessageId,
    phase: Arc<Mutex<SessionPhase>>,
    started_at: Instant,
    finalized: bool,
}

impl SessionGuard {
    fn current_phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    fn advance(&self, next: SessionPhase) {
        let mut phase = self.phase.lock();
        match phase.advance(next) {
            Ok(next) => {
                tracing::debug!(
                    message_id = %self.message_id,
                    from = phase.as_str(),
                    to = next.as_str(),
                    "session phase changed"
                );
                *phase = next;
            }
            Err(rejection) => tracing::warn!(
                message_id = %self.message_id,
                from = rejection.from.as_str(),
                to = rejection.to.as_str(),
                "rejected session phase change"
            ),
        }
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        self.release_pointer();
        self.inner.active.lock().remove(&self.message_id);
        self.inner.side_channels.clear_status(&self.message_id);
        self.inner.flags.send_replace(UiFlags::default());
        self.advance(SessionPhase::Finalized);
        self.inner.notifier.emit(UiEvent::SessionFinished {
            message_id: self.message_id.clone(),
        });
        tracing::debug!(
            message_id = %self.message_id,
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "session finalized"
        );
    }

    // The pointer slot is process-wide; a newer generation may already own it.
    fn release_pointer(&self) {
        match self.inner.pointers.get_pointer() {
            Ok(Some(pointer)) if pointer.message_id != self.message_id => {
                tracing::debug!(
                    message_id = %self.message_id,
                    pointer_message_id = %pointer.message_id,
                    "generation pointer belongs to another message; leaving it"
                );
                return;
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(
                message_id = %self.message_id,
                error = %error,
                "failed to read generation pointer during finalization"
            ),
        }

        if let Err(error) = self.inner.pointers.clear_pointer() {
            tracing::warn!(
                message_id = %self.message_id,
                error = %error,
                "failed to clear generation pointer"
            );
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.finalized {
            tracing::warn!(
                message_id = %self.message_id,
                "generation session dropped before finishing"
            );
        }
        self.finalize();
    }
}

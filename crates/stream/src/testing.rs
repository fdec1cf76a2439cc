use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc as body_mpsc;
use murmur_storage::{ConversationId, ConversationStore, MemoryStore, MessageId, MessageRole};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::controller::{SessionController, StreamConfig};
use crate::transport::{
    BoxFuture, DisconnectedSnafu, GenerationTransport, TransportError, TransportResponse,
    TransportResult,
};
use crate::ui::{UiEvent, UiNotifier};

pub(crate) const API_BASE: &str = "http://murmur.test/api";
pub(crate) const RECONNECT_URL: &str = "http://murmur.test/api/messages/m1/reconnect";

enum Reply {
    Response(TransportResponse),
    Refused,
}

/// In-process transport that hands out queued replies in order.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    posts: Mutex<VecDeque<Reply>>,
    gets: Mutex<VecDeque<Reply>>,
    post_bodies: Mutex<Vec<serde_json::Value>>,
    get_urls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub(crate) fn push_post(&self, response: TransportResponse) {
        self.posts.lock().push_back(Reply::Response(response));
    }

    pub(crate) fn push_get(&self, response: TransportResponse) {
        self.gets.lock().push_back(Reply::Response(response));
    }

    pub(crate) fn push_get_refused(&self) {
        self.gets.lock().push_back(Reply::Refused);
    }

    pub(crate) fn post_bodies(&self) -> Vec<serde_json::Value> {
        self.post_bodies.lock().clone()
    }

    pub(crate) fn get_urls(&self) -> Vec<String> {
        self.get_urls.lock().clone()
    }
}

fn into_result(reply: Option<Reply>, stage: &'static str) -> TransportResult<TransportResponse> {
    match reply {
        Some(Reply::Response(response)) => Ok(response),
        Some(Reply::Refused) | None => DisconnectedSnafu { stage }.fail(),
    }
}

impl GenerationTransport for ScriptedTransport {
    fn post_json<'a>(
        &'a self,
        _url: &'a str,
        body: &'a serde_json::Value,
    ) -> BoxFuture<'a, TransportResult<TransportResponse>> {
        self.post_bodies.lock().push(body.clone());
        let reply = self.posts.lock().pop_front();
        Box::pin(async move { into_result(reply, "scripted-post") })
    }

    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, TransportResult<TransportResponse>> {
        self.get_urls.lock().push(url.to_string());
        let reply = self.gets.lock().pop_front();
        Box::pin(async move { into_result(reply, "scripted-get") })
    }
}

pub(crate) fn event_line(event: serde_json::Value) -> String {
    format!("data: {event}\n")
}

pub(crate) fn sse_response(chunks: Vec<String>) -> TransportResponse {
    let body = futures::stream::iter(
        chunks
            .into_iter()
            .map(|chunk| Ok::<_, TransportError>(Bytes::from(chunk))),
    );
    TransportResponse::new(200, Some("text/event-stream".to_string()), body.boxed())
}

pub(crate) fn status_response(status: u16) -> TransportResponse {
    let body = futures::stream::empty::<TransportResult<Bytes>>();
    TransportResponse::new(status, None, body.boxed())
}

pub(crate) fn json_response(value: serde_json::Value) -> TransportResponse {
    let body = futures::stream::once(async move {
        Ok::<_, TransportError>(Bytes::from(value.to_string()))
    });
    TransportResponse::new(200, Some("application/json".to_string()), body.boxed())
}

/// A streaming response whose body the test feeds by hand.
pub(crate) fn live_response() -> (
    body_mpsc::UnboundedSender<TransportResult<Bytes>>,
    TransportResponse,
) {
    let (tx, rx) = body_mpsc::unbounded();
    (
        tx,
        TransportResponse::new(200, Some("text/event-stream".to_string()), rx.boxed()),
    )
}

pub(crate) struct Harness {
    pub(crate) transport: Arc<ScriptedTransport>,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) controller: SessionController,
    pub(crate) conversation_id: ConversationId,
    events: mpsc::UnboundedReceiver<UiEvent>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let transport = Arc::new(ScriptedTransport::default());
        let store = Arc::new(MemoryStore::default());
        let conversation_id = store.create_conversation().expect("create conversation").id;
        let (notifier, events) = UiNotifier::channel();
        let controller = SessionController::new(
            transport.clone(),
            store.clone(),
            store.clone(),
            StreamConfig::default(),
            notifier,
        );

        Self {
            transport,
            store,
            controller,
            conversation_id,
            events,
        }
    }

    pub(crate) fn assistant_content(&self, message_id: &MessageId) -> Option<String> {
        self.store
            .get_conversation(&self.conversation_id)
            .expect("get conversation")?
            .messages
            .into_iter()
            .find(|message| message.role == MessageRole::Assistant && &message.id == message_id)
            .map(|message| message.content)
    }

    pub(crate) fn drain_events(&mut self) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

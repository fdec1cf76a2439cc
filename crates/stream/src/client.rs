use std::sync::atomic::{AtomicBool, Ordering};

use murmur_storage::{
    Conversation, ConversationId, GenerationPointer, Message, MessageId, MessageRole,
    StorageError, unix_timestamp_millis,
};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use url::Url;

use crate::controller::{AttachOutcome, SessionController, SessionError, StreamSource};
use crate::transport::TransportError;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("prompt is empty"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("invalid api base url '{url}'"))]
    InvalidBaseUrl {
        stage: &'static str,
        url: String,
        source: url::ParseError,
    },
    #[snafu(display("api base url '{url}' cannot carry a path"))]
    UnsupportedBaseUrl { stage: &'static str, url: String },
    #[snafu(display("invalid stream url '{url}' in generation envelope"))]
    InvalidStreamUrl {
        stage: &'static str,
        url: String,
        source: url::ParseError,
    },
    #[snafu(display("conversation '{conversation_id}' was not found"))]
    ConversationNotFound {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("failed to encode completion request on `{stage}`, {source}"))]
    EncodeRequest {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("generation request failed on `{stage}`, {source}"))]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("store operation failed on `{stage}`, {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("{source}"))]
    Session {
        stage: &'static str,
        source: SessionError,
    },
}

/// URLs of the generation service, derived from one API base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    base: Url,
}

impl Endpoints {
    pub fn parse(api_base_url: &str) -> ClientResult<Self> {
        let mut base = Url::parse(api_base_url.trim()).context(InvalidBaseUrlSnafu {
            stage: "endpoints-parse",
            url: api_base_url,
        })?;
        ensure!(
            !base.cannot_be_a_base(),
            UnsupportedBaseUrlSnafu {
                stage: "endpoints-parse",
                url: api_base_url,
            }
        );
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { base })
    }

    pub fn completions(&self) -> String {
        self.with_segments(&["chat", "completions"])
    }

    pub fn reconnect(&self, message_id: &MessageId) -> String {
        self.with_segments(&["messages", message_id.as_str(), "reconnect"])
    }

    /// Resolves an envelope's `stream_url`, which may be absolute or relative to the base.
    pub fn resolve(&self, stream_url: &str) -> ClientResult<String> {
        let resolved = self.base.join(stream_url).context(InvalidStreamUrlSnafu {
            stage: "endpoints-resolve",
            url: stream_url,
        })?;
        Ok(resolved.into())
    }

    fn with_segments(&self, segments: &[&str]) -> String {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.into()
    }
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage<'a> {
    role: MessageRole,
    content: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    conversation_id: &'a ConversationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<&'a MessageId>,
}

/// JSON reply to a completion request whose stream must be fetched separately.
#[derive(Debug, Clone, Deserialize)]
struct StreamEnvelope {
    id: MessageId,
    stream_url: String,
}

/// Entry points a front end drives: send, resume after restart, switch conversation.
pub struct ChatClient {
    controller: SessionController,
    endpoints: Endpoints,
    model: String,
    resumption_attempted: AtomicBool,
}

impl ChatClient {
    pub fn new(
        controller: SessionController,
        endpoints: Endpoints,
        model: impl Into<String>,
    ) -> Self {
        Self {
            controller,
            endpoints,
            model: model.into(),
            resumption_attempted: AtomicBool::new(false),
        }
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    /// Stores the user's message, requests a reply and streams it into the conversation.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        prompt: &str,
    ) -> ClientResult<AttachOutcome> {
        ensure!(
            !prompt.trim().is_empty(),
            EmptyPromptSnafu {
                stage: "send-message-validate",
            }
        );

        let conversations = self.controller.conversations();
        conversations
            .add_message(conversation_id, Message::user(prompt))
            .context(StoreSnafu {
                stage: "send-message-add-user",
            })?;
        let conversation = self.load_conversation(conversation_id, "send-message-load")?;

        let message_id = MessageId::new_v7();
        let body = self.completion_body(&conversation, &message_id)?;
        let url = self.endpoints.completions();
        let response = self
            .controller
            .transport()
            .post_json(&url, &body)
            .await
            .context(TransportSnafu {
                stage: "send-message-post",
            })?;

        let (message_id, source) = if response.is_success() && response.is_json() {
            let envelope = response
                .json::<StreamEnvelope>()
                .await
                .context(TransportSnafu {
                    stage: "send-message-envelope",
                })?;
            let url = self.endpoints.resolve(&envelope.stream_url)?;
            tracing::debug!(
                message_id = %envelope.id,
                url = %url,
                "generation returned a stream envelope"
            );
            (envelope.id, StreamSource::Reconnect { url })
        } else {
            (message_id, StreamSource::Open(response))
        };

        let accepted = match &source {
            StreamSource::Reconnect { .. } => true,
            StreamSource::Open(response) => response.is_success(),
        };
        if accepted {
            self.remember_generation(conversation_id, &message_id)?;
        }

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            model = %self.model,
            "generation requested"
        );
        self.controller
            .attach_stream(conversation_id.clone(), message_id, source)
            .await
            .context(SessionSnafu {
                stage: "send-message-attach",
            })
    }

    /// Re-attaches to a generation that was still running when the process last exited.
    ///
    /// Only the first call per client does anything; later calls return `Ok(None)`.
    pub async fn resume_pending(&self) -> ClientResult<Option<AttachOutcome>> {
        if self.resumption_attempted.swap(true, Ordering::SeqCst) {
            tracing::debug!("resumption already attempted in this process");
            return Ok(None);
        }

        let pointers = self.controller.pointers();
        let Some(pointer) = pointers.get_pointer().context(StoreSnafu {
            stage: "resume-read-pointer",
        })?
        else {
            return Ok(None);
        };

        let conversation = self
            .controller
            .conversations()
            .get_conversation(&pointer.conversation_id)
            .context(StoreSnafu {
                stage: "resume-load-conversation",
            })?;
        if conversation.is_none() {
            tracing::warn!(
                conversation_id = %pointer.conversation_id,
                message_id = %pointer.message_id,
                "generation pointer references a missing conversation; discarding"
            );
            pointers.clear_pointer().context(StoreSnafu {
                stage: "resume-clear-orphan",
            })?;
            return Ok(None);
        }

        let url = self.endpoints.reconnect(&pointer.message_id);
        tracing::info!(
            conversation_id = %pointer.conversation_id,
            message_id = %pointer.message_id,
            "resuming interrupted generation"
        );
        self.controller
            .attach_stream(
                pointer.conversation_id,
                pointer.message_id,
                StreamSource::Reconnect { url },
            )
            .await
            .map(Some)
            .context(SessionSnafu {
                stage: "resume-attach",
            })
    }

    /// Loads another conversation and drops thinking/status text of the previous view.
    pub fn switch_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> ClientResult<Conversation> {
        self.controller.side_channels().clear_all();
        self.load_conversation(conversation_id, "switch-conversation")
    }

    fn load_conversation(
        &self,
        conversation_id: &ConversationId,
        stage: &'static str,
    ) -> ClientResult<Conversation> {
        self.controller
            .conversations()
            .get_conversation(conversation_id)
            .context(StoreSnafu { stage })?
            .context(ConversationNotFoundSnafu {
                stage,
                conversation_id: conversation_id.to_string(),
            })
    }

    fn completion_body(
        &self,
        conversation: &Conversation,
        message_id: &MessageId,
    ) -> ClientResult<serde_json::Value> {
        let request = CompletionRequest {
            model: &self.model,
            messages: conversation
                .messages
                .iter()
                .map(|message| WireMessage {
                    role: message.role,
                    content: &message.content,
                })
                .collect(),
            stream: true,
            conversation_id: &conversation.id,
            message_id: Some(message_id),
        };
        serde_json::to_value(&request).context(EncodeRequestSnafu {
            stage: "send-message-encode",
        })
    }

    fn remember_generation(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> ClientResult<()> {
        self.controller
            .pointers()
            .set_pointer(GenerationPointer::new(
                message_id.clone(),
                conversation_id.clone(),
                unix_timestamp_millis(),
            ))
            .context(StoreSnafu {
                stage: "send-message-set-pointer",
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use murmur_storage::{ConversationStore, GenerationPointerStore, MemoryStore, derive_title};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::controller::{SessionSummary, StreamConfig};
    use crate::retry::RetryPolicy;
    use crate::testing::{
        API_BASE, Harness, RECONNECT_URL, event_line, json_response, sse_response,
        status_response,
    };
    use crate::transport::{HttpTransport, TransportResponse};
    use crate::ui::UiNotifier;

    fn client(harness: &Harness) -> ChatClient {
        ChatClient::new(
            harness.controller.clone(),
            Endpoints::parse(API_BASE).expect("endpoints"),
            "murmur-test",
        )
    }

    fn completed(outcome: AttachOutcome) -> SessionSummary {
        match outcome {
            AttachOutcome::Completed(summary) => summary,
            AttachOutcome::AlreadyAttached => panic!("expected a completed session"),
        }
    }

    fn reply(text: &str) -> TransportResponse {
        sse_response(vec![
            event_line(json!({ "type": "content", "content": text })),
            event_line(json!({ "type": "complete" })),
        ])
    }

    #[test]
    fn endpoints_extend_the_base_path() {
        for base in ["http://host/api", "http://host/api/"] {
            let endpoints = Endpoints::parse(base).expect("endpoints");
            assert_eq!(endpoints.completions(), "http://host/api/chat/completions");
            assert_eq!(
                endpoints.reconnect(&MessageId::new("m1")),
                "http://host/api/messages/m1/reconnect"
            );
        }

        let root = Endpoints::parse("http://host").expect("endpoints");
        assert_eq!(root.completions(), "http://host/chat/completions");
        assert_eq!(
            root.reconnect(&MessageId::new("a/b")),
            "http://host/messages/a%2Fb/reconnect"
        );
    }

    #[test]
    fn envelope_stream_urls_resolve_against_the_base() {
        let endpoints = Endpoints::parse("http://host/api").expect("endpoints");
        assert_eq!(
            endpoints.resolve("messages/m9/reconnect").expect("relative"),
            "http://host/api/messages/m9/reconnect"
        );
        assert_eq!(
            endpoints.resolve("/stream/m9").expect("absolute path"),
            "http://host/stream/m9"
        );
        assert_eq!(
            endpoints
                .resolve("https://stream.example.com/m9")
                .expect("absolute url"),
            "https://stream.example.com/m9"
        );
    }

    #[test]
    fn bad_base_urls_are_rejected() {
        assert!(matches!(
            Endpoints::parse("not a url"),
            Err(ClientError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            Endpoints::parse("mailto:team@example.com"),
            Err(ClientError::UnsupportedBaseUrl { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn send_message_streams_the_reply_into_the_conversation() {
        let harness = Harness::new();
        let client = client(&harness);
        harness.transport.push_post(reply("Hello!"));

        let summary = completed(
            client
                .send_message(&harness.conversation_id, "What is up?")
                .await
                .expect("send"),
        );
        assert_eq!(summary.content, "Hello!");

        let conversation = harness
            .store
            .get_conversation(&harness.conversation_id)
            .expect("get")
            .expect("conversation exists");
        assert_eq!(conversation.title, derive_title("What is up?"));
        let roles = conversation
            .messages
            .iter()
            .map(|message| message.role)
            .collect::<Vec<_>>();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
        assert_eq!(conversation.messages[1].id, summary.message_id);

        let bodies = harness.transport.post_bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["stream"], true);
        assert_eq!(bodies[0]["model"], "murmur-test");
        assert_eq!(bodies[0]["conversationId"], harness.conversation_id.as_str());
        assert_eq!(bodies[0]["messageId"], summary.message_id.as_str());
        assert_eq!(bodies[0]["messages"][0]["role"], "user");
        assert_eq!(bodies[0]["messages"][0]["content"], "What is up?");

        assert_eq!(harness.store.get_pointer().expect("get pointer"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn json_envelopes_are_followed_with_a_get() {
        let harness = Harness::new();
        let client = client(&harness);
        harness.transport.push_post(json_response(json!({
            "id": "srv-1",
            "stream_url": "messages/srv-1/reconnect"
        })));
        harness.transport.push_get(reply("From envelope"));

        let summary = completed(
            client
                .send_message(&harness.conversation_id, "hi")
                .await
                .expect("send"),
        );

        assert_eq!(summary.message_id, MessageId::new("srv-1"));
        assert_eq!(summary.content, "From envelope");
        assert_eq!(
            harness.transport.get_urls(),
            vec!["http://murmur.test/api/messages/srv-1/reconnect".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_requests_surface_without_leaving_a_pointer() {
        let harness = Harness::new();
        let client = client(&harness);
        harness.transport.push_post(status_response(500));

        let error = client
            .send_message(&harness.conversation_id, "hi")
            .await
            .expect_err("500 fails");

        assert!(matches!(
            error,
            ClientError::Session {
                source: SessionError::ConnectionStatus { status: 500, .. },
                ..
            }
        ));
        assert_eq!(harness.store.get_pointer().expect("get pointer"), None);
        assert!(harness.transport.get_urls().is_empty());
    }

    #[tokio::test]
    async fn blank_prompts_are_rejected_before_any_request() {
        let harness = Harness::new();
        let client = client(&harness);

        let error = client
            .send_message(&harness.conversation_id, " \n ")
            .await
            .expect_err("blank prompt");
        assert!(matches!(error, ClientError::EmptyPrompt { .. }));
        assert!(harness.transport.post_bodies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_generation_is_resumed_once() {
        let harness = Harness::new();
        let client = client(&harness);
        harness
            .store
            .set_pointer(GenerationPointer::new(
                MessageId::new("m1"),
                harness.conversation_id.clone(),
                unix_timestamp_millis(),
            ))
            .expect("set pointer");
        harness.transport.push_get(sse_response(vec![
            event_line(json!({
                "type": "init",
                "messageId": "m1",
                "existingContent": "partial answer"
            })),
            event_line(json!({ "type": "content", "content": " done" })),
            event_line(json!({ "type": "complete" })),
        ]));

        let summary = completed(
            client
                .resume_pending()
                .await
                .expect("resume")
                .expect("pointer was fresh"),
        );
        assert_eq!(summary.content, "partial answer done");
        assert_eq!(harness.transport.get_urls(), vec![RECONNECT_URL.to_string()]);
        assert_eq!(harness.store.get_pointer().expect("get pointer"), None);

        assert_eq!(client.resume_pending().await.expect("second resume"), None);
        assert_eq!(harness.transport.get_urls().len(), 1);
    }

    #[tokio::test]
    async fn stale_pointers_are_not_resumed() {
        let harness = Harness::new();
        let client = client(&harness);
        let eleven_minutes_ago =
            unix_timestamp_millis() - Duration::from_secs(11 * 60).as_millis() as u64;
        harness
            .store
            .set_pointer(GenerationPointer::new(
                MessageId::new("m1"),
                harness.conversation_id.clone(),
                eleven_minutes_ago,
            ))
            .expect("set pointer");

        assert_eq!(client.resume_pending().await.expect("resume"), None);
        assert!(harness.transport.get_urls().is_empty());
        assert_eq!(harness.store.peek_pointer(), None);
    }

    #[tokio::test]
    async fn pointers_to_missing_conversations_are_discarded() {
        let harness = Harness::new();
        let client = client(&harness);
        harness
            .store
            .set_pointer(GenerationPointer::new(
                MessageId::new("m1"),
                ConversationId::new("gone"),
                unix_timestamp_millis(),
            ))
            .expect("set pointer");

        assert_eq!(client.resume_pending().await.expect("resume"), None);
        assert_eq!(harness.store.peek_pointer(), None);
    }

    #[tokio::test]
    async fn switching_conversations_clears_side_channels() {
        let harness = Harness::new();
        let client = client(&harness);
        let side_channels = harness.controller.side_channels();
        side_channels.append_thinking(&MessageId::new("m1"), "hmm");

        let other = harness.store.create_conversation().expect("create");
        let loaded = client.switch_conversation(&other.id).expect("switch");

        assert_eq!(loaded.id, other.id);
        assert_eq!(side_channels.thinking(&MessageId::new("m1")), None);
        assert!(matches!(
            client.switch_conversation(&ConversationId::new("missing")),
            Err(ClientError::ConversationNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn http_round_trip_against_a_live_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                concat!(
                    "data: {\"type\":\"init\",\"messageId\":\"ignored\"}\n",
                    "data: {\"type\":\"content\",\"content\":\"Live\"}\n",
                    "data: [DONE]\n",
                    "data: {\"type\":\"complete\"}\n",
                ),
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::default());
        let conversation = store.create_conversation().expect("create");
        let config = StreamConfig {
            retry: RetryPolicy::new(1, Duration::from_millis(5), Duration::from_millis(5)),
            char_delay: Duration::from_millis(1),
            skeleton_delay: Duration::from_millis(5),
        };
        let controller = SessionController::new(
            Arc::new(HttpTransport::new().expect("http client")),
            store.clone(),
            store.clone(),
            config,
            UiNotifier::disabled(),
        );
        let endpoints = Endpoints::parse(&format!("{}/v1", server.uri())).expect("endpoints");
        let client = ChatClient::new(controller, endpoints, "murmur-test");

        let summary = completed(
            client
                .send_message(&conversation.id, "ping")
                .await
                .expect("send"),
        );
        assert_eq!(summary.content, "Live");

        let stored = store
            .get_conversation(&conversation.id)
            .expect("get")
            .expect("conversation exists");
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[1].content, "Live");
        assert_eq!(store.get_pointer().expect("get pointer"), None);
    }
}

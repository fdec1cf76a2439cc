use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use murmur_storage::{
    ConversationId, ConversationStore, GenerationPointerStore, MessageRole, SqliteStore,
    StorageError, SystemClock,
};
use murmur_stream::{
    AttachOutcome, ChatClient, ClientError, Endpoints, GenerationTransport, HttpTransport,
    SessionController, SessionSummary, TransportError, UiNotifier,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::cli::Command;
use crate::settings::{Settings, SettingsError, SettingsStore};

pub const EXIT_COMMANDS: [&str; 2] = ["/quit", "/exit"];

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("settings failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("database path {path:?} is not valid UTF-8"))]
    DatabasePath { stage: &'static str, path: PathBuf },
    #[snafu(display("failed to open conversation store on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("store operation failed on `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to set up http transport on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("{source}"))]
    Client {
        stage: &'static str,
        source: ClientError,
    },
    #[snafu(display("conversation '{conversation_id}' was not found"))]
    ConversationNotFound {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("failed to encode settings on `{stage}`: {source}"))]
    EncodeSettings {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    Output {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    Input {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("renderer task failed on `{stage}`: {source}"))]
    RendererTask {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
}

pub type AppResult<T> = Result<T, AppError>;

/// Wired-up client plus direct store access for the non-streaming commands.
pub struct App {
    settings: Arc<Settings>,
    conversations: Arc<dyn ConversationStore>,
    client: ChatClient,
}

impl App {
    /// Opens the SQLite store and HTTP transport described by `settings`.
    pub async fn open(settings: Arc<Settings>, notifier: UiNotifier) -> AppResult<Self> {
        let path = settings.database_location();
        let location = path.to_str().context(DatabasePathSnafu {
            stage: "app-open-database-path",
            path: path.clone(),
        })?;
        let store = SqliteStore::open_with_clock(
            location,
            Arc::new(SystemClock),
            settings.pointer_ttl(),
        )
        .await
        .context(OpenStoreSnafu {
            stage: "app-open-store",
        })?;
        let transport = HttpTransport::new().context(TransportSnafu {
            stage: "app-open-transport",
        })?;

        Self::new(settings, Arc::new(store), Arc::new(transport), notifier)
    }

    pub fn new<S>(
        settings: Arc<Settings>,
        store: Arc<S>,
        transport: Arc<dyn GenerationTransport>,
        notifier: UiNotifier,
    ) -> AppResult<Self>
    where
        S: ConversationStore + GenerationPointerStore + 'static,
    {
        let endpoints = Endpoints::parse(&settings.api_base_url).context(ClientSnafu {
            stage: "app-parse-endpoints",
        })?;
        let controller = SessionController::new(
            transport,
            store.clone(),
            store.clone(),
            settings.stream_config(),
            notifier,
        );
        let client = ChatClient::new(controller, endpoints, settings.model.clone());

        Ok(Self {
            settings,
            conversations: store,
            client,
        })
    }

    pub async fn execute<R, W>(&self, command: Command, input: R, out: &mut W) -> AppResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        match command {
            Command::Chat {
                conversation,
                prompt,
            } => self.chat(conversation.as_deref(), &prompt, input, out).await,
            Command::Resume => {
                if self.resume().await?.is_none() {
                    write_line(out, "no interrupted generation to resume")?;
                }
                Ok(())
            }
            Command::List => self.list(out),
            Command::Show { conversation } => self.show(&conversation, out),
            Command::Rename {
                conversation,
                title,
            } => self.rename(&conversation, &title, out),
            Command::Delete { conversation } => self.delete(&conversation, out),
            Command::Config { .. } => print_settings(&self.settings, out),
        }
    }

    /// Attaches to the generation recorded by the previous run, if it is still fresh.
    pub async fn resume(&self) -> AppResult<Option<SessionSummary>> {
        let outcome = self.client.resume_pending().await.context(ClientSnafu {
            stage: "app-resume",
        })?;
        Ok(match outcome {
            Some(AttachOutcome::Completed(summary)) => Some(summary),
            Some(AttachOutcome::AlreadyAttached) | None => None,
        })
    }

    async fn chat<R, W>(
        &self,
        conversation: Option<&str>,
        prompt: &[String],
        input: R,
        out: &mut W,
    ) -> AppResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        if let Err(error) = self.resume().await {
            tracing::warn!(error = %error, "resuming the interrupted generation failed");
        }

        let conversation_id = match conversation {
            Some(raw) => {
                let conversation_id = parse_conversation_id(raw, "chat-parse-conversation")?;
                self.client
                    .switch_conversation(&conversation_id)
                    .context(ClientSnafu {
                        stage: "chat-switch-conversation",
                    })?
                    .id
            }
            None => {
                self.conversations
                    .create_conversation()
                    .context(StoreSnafu {
                        stage: "chat-create-conversation",
                    })?
                    .id
            }
        };
        tracing::info!(conversation_id = %conversation_id, "chat session ready");

        if !prompt.is_empty() {
            return self.send(&conversation_id, &prompt.join(" ")).await;
        }

        write_line(
            out,
            &format!("conversation {conversation_id}; type /quit to leave"),
        )?;
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.context(InputSnafu {
            stage: "chat-read-line",
        })? {
            let line = line.trim();
            if EXIT_COMMANDS.contains(&line) {
                break;
            }
            if line.is_empty() {
                continue;
            }
            if let Err(error) = self.send(&conversation_id, line).await {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "message failed"
                );
                write_line(out, &format!("error: {error}"))?;
            }
        }
        Ok(())
    }

    async fn send(&self, conversation_id: &ConversationId, prompt: &str) -> AppResult<()> {
        let outcome = self
            .client
            .send_message(conversation_id, prompt)
            .await
            .context(ClientSnafu {
                stage: "chat-send-message",
            })?;
        match outcome {
            AttachOutcome::Completed(summary) if !summary.completed => {
                tracing::warn!(
                    message_id = %summary.message_id,
                    "stream ended without a completion event"
                );
            }
            AttachOutcome::Completed(_) => {}
            AttachOutcome::AlreadyAttached => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    "generation is already streaming"
                );
            }
        }
        Ok(())
    }

    fn list<W: Write>(&self, out: &mut W) -> AppResult<()> {
        let conversations = self.conversations.list_conversations().context(StoreSnafu {
            stage: "list-conversations",
        })?;
        if conversations.is_empty() {
            return write_line(out, "no conversations");
        }

        let streaming = self.client.controller().streaming_conversations();
        for conversation in conversations {
            let marker = if streaming.contains(&conversation.id) {
                " *"
            } else {
                ""
            };
            write_line(
                out,
                &format!(
                    "{}  {} ({} messages){marker}",
                    conversation.id,
                    conversation.title,
                    conversation.messages.len()
                ),
            )?;
        }
        Ok(())
    }

    fn show<W: Write>(&self, raw_id: &str, out: &mut W) -> AppResult<()> {
        let conversation_id = parse_conversation_id(raw_id, "show-parse-conversation")?;
        let conversation = self
            .client
            .switch_conversation(&conversation_id)
            .context(ClientSnafu {
                stage: "show-conversation",
            })?;

        write_line(out, &format!("# {}", conversation.title))?;
        for message in &conversation.messages {
            let label = match message.role {
                MessageRole::User => "you",
                MessageRole::Assistant => "assistant",
                MessageRole::System => "system",
            };
            write_line(out, &format!("{label}> {}", message.content))?;
        }
        Ok(())
    }

    fn rename<W: Write>(&self, raw_id: &str, title: &str, out: &mut W) -> AppResult<()> {
        let conversation_id = parse_conversation_id(raw_id, "rename-parse-conversation")?;
        let conversation = self
            .conversations
            .set_title(&conversation_id, title)
            .context(StoreSnafu {
                stage: "rename-conversation",
            })?;
        write_line(out, &format!("{}  {}", conversation.id, conversation.title))
    }

    fn delete<W: Write>(&self, raw_id: &str, out: &mut W) -> AppResult<()> {
        let conversation_id = parse_conversation_id(raw_id, "delete-parse-conversation")?;
        let exists = self
            .conversations
            .get_conversation(&conversation_id)
            .context(StoreSnafu {
                stage: "delete-load-conversation",
            })?
            .is_some();
        snafu::ensure!(
            exists,
            ConversationNotFoundSnafu {
                stage: "delete-conversation",
                conversation_id: conversation_id.to_string(),
            }
        );

        self.conversations
            .delete_conversation(&conversation_id)
            .context(StoreSnafu {
                stage: "delete-conversation",
            })?;
        write_line(out, &format!("deleted {conversation_id}"))
    }
}

/// Persists the effective settings for `murmur config --save`.
pub fn save_settings(store: &SettingsStore, settings: &Settings) -> AppResult<()> {
    store.update(settings.clone()).context(SettingsSnafu {
        stage: "config-save",
    })
}

pub fn print_settings<W: Write>(settings: &Settings, out: &mut W) -> AppResult<()> {
    let rendered = serde_json::to_string_pretty(settings).context(EncodeSettingsSnafu {
        stage: "config-print",
    })?;
    write_line(out, &rendered)
}

fn parse_conversation_id(raw: &str, stage: &'static str) -> AppResult<ConversationId> {
    ConversationId::parse(raw).context(StoreSnafu { stage })
}

fn write_line<W: Write>(out: &mut W, line: &str) -> AppResult<()> {
    writeln!(out, "{line}").context(OutputSnafu {
        stage: "write-output",
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use bytes::Bytes;
    use futures::StreamExt;
    use murmur_storage::{GenerationPointer, MemoryStore, MessageId};
    use murmur_stream::{BoxFuture, TransportResponse, TransportResult};

    use super::*;

    /// Replies to POSTs and GETs from separate queues; an empty queue answers 503.
    #[derive(Default)]
    struct QueuedTransport {
        posts: Mutex<VecDeque<TransportResponse>>,
        gets: Mutex<VecDeque<TransportResponse>>,
        get_urls: Mutex<Vec<String>>,
    }

    fn sse(lines: &[&str]) -> TransportResponse {
        let chunks = lines
            .iter()
            .map(|line| Ok(Bytes::from(format!("data: {line}\n"))))
            .collect::<Vec<TransportResult<Bytes>>>();
        TransportResponse::new(
            200,
            Some("text/event-stream".to_string()),
            futures::stream::iter(chunks).boxed(),
        )
    }

    fn unavailable() -> TransportResponse {
        let body = futures::stream::empty::<TransportResult<Bytes>>();
        TransportResponse::new(503, None, body.boxed())
    }

    impl GenerationTransport for QueuedTransport {
        fn post_json<'a>(
            &'a self,
            _url: &'a str,
            _body: &'a serde_json::Value,
        ) -> BoxFuture<'a, TransportResult<TransportResponse>> {
            let reply = self.posts.lock().expect("posts").pop_front();
            Box::pin(async move { Ok(reply.unwrap_or_else(unavailable)) })
        }

        fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, TransportResult<TransportResponse>> {
            self.get_urls.lock().expect("urls").push(url.to_string());
            let reply = self.gets.lock().expect("gets").pop_front();
            Box::pin(async move { Ok(reply.unwrap_or_else(unavailable)) })
        }
    }

    fn test_settings() -> Arc<Settings> {
        let mut settings = Settings::default();
        settings.api_base_url = "http://murmur.test/api".to_string();
        Arc::new(settings)
    }

    fn build(store: Arc<MemoryStore>, transport: Arc<QueuedTransport>) -> App {
        App::new(test_settings(), store, transport, UiNotifier::disabled()).expect("app")
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_chat_stores_both_sides_of_the_exchange() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(QueuedTransport::default());
        transport.posts.lock().expect("posts").push_back(sse(&[
            r#"{"type":"content","content":"Hello!"}"#,
            r#"{"type":"complete"}"#,
        ]));
        let app = build(store.clone(), transport);

        let mut out = Vec::new();
        app.execute(
            Command::Chat {
                conversation: None,
                prompt: vec!["hi".to_string(), "there".to_string()],
            },
            &b""[..],
            &mut out,
        )
        .await
        .expect("chat");

        let conversations = store.list_conversations().expect("list");
        assert_eq!(conversations.len(), 1);
        let messages = &conversations[0].messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hi there");
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, "Hello!");
        assert_eq!(conversations[0].title, "hi there");
        assert!(store.get_pointer().expect("pointer").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_chat_reports_failures_and_keeps_reading() {
        let store = Arc::new(MemoryStore::default());
        let conversation_id = store.create_conversation().expect("create").id;
        let transport = Arc::new(QueuedTransport::default());
        transport
            .posts
            .lock()
            .expect("posts")
            .extend([unavailable(), sse(&[r#"{"type":"content","content":"ok"}"#])]);
        let app = build(store.clone(), transport);

        let mut out = Vec::new();
        app.execute(
            Command::Chat {
                conversation: Some(conversation_id.to_string()),
                prompt: Vec::new(),
            },
            &b"first\n\nsecond\n/quit\nignored\n"[..],
            &mut out,
        )
        .await
        .expect("chat");

        let printed = String::from_utf8(out).expect("utf8");
        assert!(printed.contains("error:"), "{printed}");

        let conversation = store
            .get_conversation(&conversation_id)
            .expect("get")
            .expect("conversation");
        let contents = conversation
            .messages
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, ["first", "second", "ok"]);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_command_reattaches_to_the_recorded_generation() {
        let store = Arc::new(MemoryStore::default());
        let conversation_id = store.create_conversation().expect("create").id;
        store
            .set_pointer(GenerationPointer::new(
                MessageId::new("m1"),
                conversation_id.clone(),
                murmur_storage::unix_timestamp_millis(),
            ))
            .expect("pointer");
        let transport = Arc::new(QueuedTransport::default());
        transport.gets.lock().expect("gets").push_back(sse(&[
            r#"{"type":"init","messageId":"m1","existingContent":"partial"}"#,
            r#"{"type":"content","content":" answer"}"#,
            r#"{"type":"complete"}"#,
        ]));
        let app = build(store.clone(), transport.clone());

        let mut out = Vec::new();
        app.execute(Command::Resume, &b""[..], &mut out)
            .await
            .expect("resume");

        assert_eq!(
            *transport.get_urls.lock().expect("urls"),
            ["http://murmur.test/api/messages/m1/reconnect"]
        );
        let conversation = store
            .get_conversation(&conversation_id)
            .expect("get")
            .expect("conversation");
        assert_eq!(conversation.messages[0].content, "partial answer");
        assert!(out.is_empty());

        let mut out = Vec::new();
        app.execute(Command::Resume, &b""[..], &mut out)
            .await
            .expect("second resume");
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "no interrupted generation to resume\n"
        );
    }

    #[tokio::test]
    async fn list_show_rename_and_delete() {
        let store = Arc::new(MemoryStore::default());
        let conversation_id = store.create_conversation().expect("create").id;
        store
            .add_message(&conversation_id, murmur_storage::Message::user("What is Rust?"))
            .expect("add");
        let app = build(store.clone(), Arc::new(QueuedTransport::default()));

        let mut out = Vec::new();
        app.execute(Command::List, &b""[..], &mut out)
            .await
            .expect("list");
        let listed = String::from_utf8(out).expect("utf8");
        assert!(listed.contains("What is Rust? (1 messages)"), "{listed}");

        let mut out = Vec::new();
        app.execute(
            Command::Rename {
                conversation: conversation_id.to_string(),
                title: "Rust".to_string(),
            },
            &b""[..],
            &mut out,
        )
        .await
        .expect("rename");

        let mut out = Vec::new();
        app.execute(
            Command::Show {
                conversation: conversation_id.to_string(),
            },
            &b""[..],
            &mut out,
        )
        .await
        .expect("show");
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "# Rust\nyou> What is Rust?\n"
        );

        let mut out = Vec::new();
        app.execute(
            Command::Delete {
                conversation: conversation_id.to_string(),
            },
            &b""[..],
            &mut out,
        )
        .await
        .expect("delete");
        assert!(store.list_conversations().expect("list").is_empty());

        let error = app
            .execute(
                Command::Delete {
                    conversation: conversation_id.to_string(),
                },
                &b""[..],
                &mut Vec::new(),
            )
            .await
            .expect_err("already deleted");
        assert!(matches!(error, AppError::ConversationNotFound { .. }));
    }
}

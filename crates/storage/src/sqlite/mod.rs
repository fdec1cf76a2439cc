use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection};

use super::clock::{Clock, SystemClock};
use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu,
    SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu, StorageResult, UnknownMessageRoleSnafu,
    WorkerPanickedSnafu,
};
use super::ids::{ConversationId, MessageId};
use super::types::{
    Conversation, GENERATION_POINTER_TTL, GenerationPointer, Message, MessageRole,
};
use super::{ConversationStore, GenerationPointerStore};

/// SQLite-backed implementation of both store traits.
#[derive(Clone)]
pub struct SqliteStore {
    database_url: String,
    clock: Arc<dyn Clock>,
    pointer_ttl: Duration,
}

impl SqliteStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        Self::open_with_clock(database_location, Arc::new(SystemClock), GENERATION_POINTER_TTL)
            .await
    }

    pub async fn open_with_clock(
        database_location: &str,
        clock: Arc<dyn Clock>,
        pointer_ttl: Duration,
    ) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        // Store calls open their own connections; the bootstrap pool is only for migrations.
        pool.close().await;
        tracing::info!(database_url = %database_url, "opened sqlite conversation store");

        Ok(Self {
            database_url,
            clock,
            pointer_ttl,
        })
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => WorkerPanickedSnafu { stage }.fail(),
        }
    }
}

impl ConversationStore for SqliteStore {
    fn list_conversations(&self) -> StorageResult<Vec<Conversation>> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-list-connect").await?;
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, title_set_by_user, created_at, updated_at FROM conversations ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            let mut conversations = Vec::with_capacity(rows.len());
            for row in rows {
                let messages = load_messages(&mut connection, &row.id).await?;
                conversations.push(conversation_row_to_record(row, messages)?);
            }
            Ok(conversations)
        })
    }

    fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> StorageResult<Option<Conversation>> {
        let database_url = self.database_url.clone();
        let conversation_id = conversation_id.clone();
        self.run_db_call("conversation-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-get-connect").await?;
            load_conversation(&mut connection, &conversation_id).await
        })
    }

    fn save_conversation(&self, conversation: &Conversation) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let conversation = conversation.clone();
        self.run_db_call("conversation-save", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-save-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "conversation-save-begin",
            })?;

            sqlx::query(
                "INSERT INTO conversations (id, title, title_set_by_user, created_at, updated_at) VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET title = excluded.title, title_set_by_user = excluded.title_set_by_user, \
                 created_at = excluded.created_at, updated_at = excluded.updated_at",
            )
            .bind(conversation.id.as_str())
            .bind(conversation.title.as_str())
            .bind(i64::from(conversation.title_set_by_user))
            .bind(u64_to_i64(conversation.created_at_unix_millis, "conversation-save-created-at")?)
            .bind(u64_to_i64(conversation.updated_at_unix_millis, "conversation-save-updated-at")?)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-save-upsert",
            })?;

            // Full replacement keeps message order identical to the in-memory aggregate.
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(conversation.id.as_str())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-save-clear-messages",
                })?;

            for (seq, message) in conversation.messages.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO messages (conversation_id, id, seq, role, content, created_at) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(conversation.id.as_str())
                .bind(message.id.as_str())
                .bind(usize_to_i64(seq, "conversation-save-seq")?)
                .bind(message.role.as_str())
                .bind(message.content.as_str())
                .bind(u64_to_i64(message.timestamp_unix_millis, "conversation-save-message-timestamp")?)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-save-insert-message",
                })?;
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "conversation-save-commit",
            })
        })
    }

    fn add_message(&self, conversation_id: &ConversationId, message: Message) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let conversation_id = conversation_id.clone();
        let now = self.clock.now_unix_millis();
        self.run_db_call("message-add", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-add-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "message-add-begin",
            })?;

            let mut conversation = load_conversation(&mut *tx, &conversation_id)
                .await?
                .context(NotFoundSnafu {
                    stage: "message-add-load-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })?;

            let message_id = message.id.clone();
            conversation.upsert_message(message, now);
            let (seq, stored) = conversation
                .messages
                .iter()
                .enumerate()
                .find(|(_, candidate)| candidate.id == message_id)
                .context(InvariantViolationSnafu {
                    stage: "message-add-locate",
                    details: format!("message '{message_id}' missing after upsert"),
                })?;

            sqlx::query(
                "INSERT INTO messages (conversation_id, id, seq, role, content, created_at) VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(conversation_id, id) DO UPDATE SET content = excluded.content",
            )
            .bind(conversation.id.as_str())
            .bind(stored.id.as_str())
            .bind(usize_to_i64(seq, "message-add-seq")?)
            .bind(stored.role.as_str())
            .bind(stored.content.as_str())
            .bind(u64_to_i64(stored.timestamp_unix_millis, "message-add-timestamp")?)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-add-upsert",
            })?;

            sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
                .bind(conversation.title.as_str())
                .bind(u64_to_i64(conversation.updated_at_unix_millis, "message-add-updated-at")?)
                .bind(conversation.id.as_str())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-add-touch-conversation",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-add-commit",
            })
        })
    }

    fn update_message_content(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        content: &str,
    ) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let conversation_id = conversation_id.clone();
        let message_id = message_id.clone();
        let content = content.to_string();
        let now = u64_to_i64(self.clock.now_unix_millis(), "message-update-now")?;
        self.run_db_call("message-update", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-update-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "message-update-begin",
            })?;

            let result =
                sqlx::query("UPDATE messages SET content = ? WHERE conversation_id = ? AND id = ?")
                    .bind(content)
                    .bind(conversation_id.as_str())
                    .bind(message_id.as_str())
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-update-apply",
                    })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-update-missing",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }

            sqlx::query("UPDATE conversations SET updated_at = MAX(updated_at, ?) WHERE id = ?")
                .bind(now)
                .bind(conversation_id.as_str())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-update-touch-conversation",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-update-commit",
            })
        })
    }

    fn delete_conversation(&self, conversation_id: &ConversationId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let conversation_id = conversation_id.clone();
        self.run_db_call("conversation-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-delete-connect").await?;
            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(conversation_id.as_str())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete-apply",
                })?;
            Ok(())
        })
    }
}

impl GenerationPointerStore for SqliteStore {
    fn set_pointer(&self, pointer: GenerationPointer) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("pointer-set", async move {
            let mut connection =
                connect_store_connection(&database_url, "pointer-set-connect").await?;
            sqlx::query(
                "INSERT INTO generation_pointer (slot, message_id, conversation_id, started_at) VALUES (0, ?, ?, ?) \
                 ON CONFLICT(slot) DO UPDATE SET message_id = excluded.message_id, \
                 conversation_id = excluded.conversation_id, started_at = excluded.started_at",
            )
            .bind(pointer.message_id.as_str())
            .bind(pointer.conversation_id.as_str())
            .bind(u64_to_i64(pointer.started_at_unix_millis, "pointer-set-started-at")?)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "pointer-set-upsert",
            })?;
            Ok(())
        })
    }

    fn get_pointer(&self) -> StorageResult<Option<GenerationPointer>> {
        let database_url = self.database_url.clone();
        let now = self.clock.now_unix_millis();
        let ttl = self.pointer_ttl;
        self.run_db_call("pointer-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "pointer-get-connect").await?;
            let row = sqlx::query_as::<_, PointerRow>(
                "SELECT message_id, conversation_id, started_at FROM generation_pointer WHERE slot = 0",
            )
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "pointer-get-query",
            })?;

            let Some(row) = row else {
                return Ok(None);
            };

            let pointer = GenerationPointer::new(
                MessageId::parse(&row.message_id)?,
                ConversationId::parse(&row.conversation_id)?,
                i64_to_u64(row.started_at, "pointer-row-started-at")?,
            );

            if pointer.is_stale(now, ttl) {
                tracing::debug!(message_id = %pointer.message_id, "discarding stale generation pointer");
                sqlx::query("DELETE FROM generation_pointer")
                    .execute(&mut connection)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "pointer-get-clear-stale",
                    })?;
                return Ok(None);
            }

            Ok(Some(pointer))
        })
    }

    fn clear_pointer(&self) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("pointer-clear", async move {
            let mut connection =
                connect_store_connection(&database_url, "pointer-clear-connect").await?;
            sqlx::query("DELETE FROM generation_pointer")
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "pointer-clear-apply",
                })?;
            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    title_set_by_user: i64,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    role: String,
    content: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct PointerRow {
    message_id: String,
    conversation_id: String,
    started_at: i64,
}

async fn load_conversation(
    connection: &mut SqliteConnection,
    conversation_id: &ConversationId,
) -> StorageResult<Option<Conversation>> {
    let row = sqlx::query_as::<_, ConversationRow>(
        "SELECT id, title, title_set_by_user, created_at, updated_at FROM conversations WHERE id = ?",
    )
    .bind(conversation_id.as_str())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "conversation-load-query",
    })?;

    let Some(row) = row else {
        return Ok(None);
    };

    let messages = load_messages(connection, &row.id).await?;
    conversation_row_to_record(row, messages).map(Some)
}

async fn load_messages(
    connection: &mut SqliteConnection,
    conversation_id: &str,
) -> StorageResult<Vec<Message>> {
    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT id, role, content, created_at FROM messages WHERE conversation_id = ? ORDER BY seq ASC",
    )
    .bind(conversation_id)
    .fetch_all(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "message-load-query",
    })?;

    rows.into_iter().map(message_row_to_record).collect()
}

fn conversation_row_to_record(
    row: ConversationRow,
    messages: Vec<Message>,
) -> StorageResult<Conversation> {
    Ok(Conversation {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        title_set_by_user: row.title_set_by_user != 0,
        messages,
        created_at_unix_millis: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_millis: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<Message> {
    Ok(Message {
        id: MessageId::parse(&row.id)?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        timestamp_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "system" => Ok(MessageRole::System),
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => UnknownMessageRoleSnafu {
            stage: "message-role-from-sql",
            role: raw,
        }
        .fail(),
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    convert_integer(value, stage)
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    convert_integer(value, stage)
}

fn usize_to_i64(value: usize, stage: &'static str) -> StorageResult<i64> {
    convert_integer(value, stage)
}

fn convert_integer<Src, Dst>(value: Src, stage: &'static str) -> StorageResult<Dst>
where
    Src: Copy + std::fmt::Display,
    Dst: TryFrom<Src>,
{
    Dst::try_from(value).ok().context(InvariantViolationSnafu {
        stage,
        details: format!(
            "integer {value} does not fit {}",
            std::any::type_name::<Dst>()
        ),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}

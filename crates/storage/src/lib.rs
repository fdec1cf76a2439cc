use snafu::OptionExt;

pub mod clock;
pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
    AUTO_TITLE_MAX_CHARS, Conversation, DEFAULT_CONVERSATION_TITLE, GENERATION_POINTER_TTL,
    GenerationPointer, Message, MessageRole, derive_title, unix_timestamp_millis,
};

/// Conversation persistence consumed by the streaming client.
///
/// Implementations use read-modify-write without cross-call locking; callers that
/// need exclusivity per message rely on the session controller's single-flight guard.
pub trait ConversationStore: Send + Sync {
    fn list_conversations(&self) -> StorageResult<Vec<Conversation>>;
    fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> StorageResult<Option<Conversation>>;
    fn save_conversation(&self, conversation: &Conversation) -> StorageResult<()>;
    /// Appends a message, replacing the content of an existing message with the same id.
    fn add_message(&self, conversation_id: &ConversationId, message: Message) -> StorageResult<()>;
    /// Replaces one message's content and bumps the conversation's `updated_at`.
    fn update_message_content(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        content: &str,
    ) -> StorageResult<()>;
    fn delete_conversation(&self, conversation_id: &ConversationId) -> StorageResult<()>;

    fn create_conversation(&self) -> StorageResult<Conversation> {
        let conversation = Conversation::new(ConversationId::new_v7(), unix_timestamp_millis());
        self.save_conversation(&conversation)?;
        Ok(conversation)
    }

    fn set_title(
        &self,
        conversation_id: &ConversationId,
        title: &str,
    ) -> StorageResult<Conversation> {
        let mut conversation = self
            .get_conversation(conversation_id)?
            .context(error::NotFoundSnafu {
                stage: "conversation-set-title",
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;
        conversation.set_user_title(title, unix_timestamp_millis());
        self.save_conversation(&conversation)?;
        Ok(conversation)
    }
}

/// Single-slot record of the generation currently tracked for resumption.
pub trait GenerationPointerStore: Send + Sync {
    fn set_pointer(&self, pointer: GenerationPointer) -> StorageResult<()>;
    /// Returns the pointer unless it is older than the TTL, in which case it is cleared.
    fn get_pointer(&self) -> StorageResult<Option<GenerationPointer>>;
    fn clear_pointer(&self) -> StorageResult<()>;
}

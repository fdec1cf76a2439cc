use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use snafu::OptionExt;

use super::clock::{Clock, SystemClock};
use super::error::{NotFoundSnafu, StorageResult};
use super::ids::{ConversationId, MessageId};
use super::types::{Conversation, GENERATION_POINTER_TTL, GenerationPointer, Message};
use super::{ConversationStore, GenerationPointerStore};

/// Process-local store backing both collaborator interfaces.
pub struct MemoryStore {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
    pointer: Mutex<Option<GenerationPointer>>,
    clock: Arc<dyn Clock>,
    pointer_ttl: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), GENERATION_POINTER_TTL)
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>, pointer_ttl: Duration) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            pointer: Mutex::new(None),
            clock,
            pointer_ttl,
        }
    }

    /// Reads the pointer slot without applying the staleness check.
    pub fn peek_pointer(&self) -> Option<GenerationPointer> {
        self.pointer.lock().clone()
    }
}

impl ConversationStore for MemoryStore {
    fn list_conversations(&self) -> StorageResult<Vec<Conversation>> {
        let mut conversations = self
            .conversations
            .read()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        conversations.sort_by(|left, right| {
            right
                .updated_at_unix_millis
                .cmp(&left.updated_at_unix_millis)
                .then_with(|| right.id.cmp(&left.id))
        });
        Ok(conversations)
    }

    fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> StorageResult<Option<Conversation>> {
        Ok(self.conversations.read().get(conversation_id).cloned())
    }

    fn save_conversation(&self, conversation: &Conversation) -> StorageResult<()> {
        self.conversations
            .write()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    fn add_message(&self, conversation_id: &ConversationId, message: Message) -> StorageResult<()> {
        let now = self.clock.now_unix_millis();
        let mut conversations = self.conversations.write();
        let conversation = conversations
            .get_mut(conversation_id)
            .context(NotFoundSnafu {
                stage: "memory-add-message",
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;
        conversation.upsert_message(message, now);
        Ok(())
    }

    fn update_message_content(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        content: &str,
    ) -> StorageResult<()> {
        let now = self.clock.now_unix_millis();
        let mut conversations = self.conversations.write();
        let conversation = conversations
            .get_mut(conversation_id)
            .context(NotFoundSnafu {
                stage: "memory-update-message-conversation",
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;

        if !conversation.replace_message_content(message_id, content, now) {
            return NotFoundSnafu {
                stage: "memory-update-message",
                entity: "message",
                id: message_id.to_string(),
            }
            .fail();
        }
        Ok(())
    }

    fn delete_conversation(&self, conversation_id: &ConversationId) -> StorageResult<()> {
        self.conversations.write().remove(conversation_id);
        Ok(())
    }
}

impl GenerationPointerStore for MemoryStore {
    fn set_pointer(&self, pointer: GenerationPointer) -> StorageResult<()> {
        *self.pointer.lock() = Some(pointer);
        Ok(())
    }

    fn get_pointer(&self) -> StorageResult<Option<GenerationPointer>> {
        let mut slot = self.pointer.lock();
        let now = self.clock.now_unix_millis();

        if slot
            .as_ref()
            .is_some_and(|pointer| pointer.is_stale(now, self.pointer_ttl))
        {
            tracing::debug!("discarding stale generation pointer");
            *slot = None;
        }

        Ok(slot.clone())
    }

    fn clear_pointer(&self) -> StorageResult<()> {
        *self.pointer.lock() = None;
        Ok(())
    }
}

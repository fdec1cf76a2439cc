use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId};

/// Title used until the first user message names the conversation.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Auto-derived titles are cut to this many characters.
pub const AUTO_TITLE_MAX_CHARS: usize = 50;

/// Generation pointers older than this are discarded at read time.
pub const GENERATION_POINTER_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub timestamp_unix_millis: u64,
}

impl Message {
    pub fn new(
        id: MessageId,
        role: MessageRole,
        content: impl Into<String>,
        timestamp_unix_millis: u64,
    ) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            timestamp_unix_millis,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(
            MessageId::new_v7(),
            MessageRole::User,
            content,
            unix_timestamp_millis(),
        )
    }

    pub fn assistant(id: MessageId, content: impl Into<String>) -> Self {
        Self::new(id, MessageRole::Assistant, content, unix_timestamp_millis())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub title_set_by_user: bool,
    pub messages: Vec<Message>,
    pub created_at_unix_millis: u64,
    pub updated_at_unix_millis: u64,
}

impl Conversation {
    pub fn new(id: ConversationId, now_unix_millis: u64) -> Self {
        Self {
            id,
            title: DEFAULT_CONVERSATION_TITLE.to_string(),
            title_set_by_user: false,
            messages: Vec::new(),
            created_at_unix_millis: now_unix_millis,
            updated_at_unix_millis: now_unix_millis,
        }
    }

    pub fn message(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == message_id)
    }

    /// Appends a message, or replaces the content of an existing one with the same id.
    ///
    /// Replacing keeps resumed generations from duplicating the partial message that
    /// was persisted before the client restarted.
    pub fn upsert_message(&mut self, message: Message, now_unix_millis: u64) {
        if let Some(existing) = self
            .messages
            .iter_mut()
            .find(|existing| existing.id == message.id)
        {
            existing.content = message.content;
        } else {
            self.messages.push(message);
        }

        self.refresh_auto_title();
        self.touch(now_unix_millis);
    }

    /// Replaces the content of one message; returns false if the id is unknown.
    pub fn replace_message_content(
        &mut self,
        message_id: &MessageId,
        content: &str,
        now_unix_millis: u64,
    ) -> bool {
        let Some(message) = self
            .messages
            .iter_mut()
            .find(|message| &message.id == message_id)
        else {
            return false;
        };

        message.content.clear();
        message.content.push_str(content);
        self.touch(now_unix_millis);
        true
    }

    pub fn set_user_title(&mut self, title: &str, now_unix_millis: u64) {
        let title = title.trim();
        if title.is_empty() {
            self.title_set_by_user = false;
            self.title = DEFAULT_CONVERSATION_TITLE.to_string();
            self.refresh_auto_title();
        } else {
            self.title_set_by_user = true;
            self.title = title.to_string();
        }
        self.touch(now_unix_millis);
    }

    pub fn touch(&mut self, now_unix_millis: u64) {
        self.updated_at_unix_millis = self.updated_at_unix_millis.max(now_unix_millis);
    }

    fn refresh_auto_title(&mut self) {
        if self.title_set_by_user {
            return;
        }

        if let Some(first_user) = self
            .messages
            .iter()
            .find(|message| message.role == MessageRole::User)
        {
            self.title = derive_title(&first_user.content);
        }
    }
}

/// Builds a sidebar title from the first user message.
pub fn derive_title(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return DEFAULT_CONVERSATION_TITLE.to_string();
    }

    if collapsed.chars().count() <= AUTO_TITLE_MAX_CHARS {
        return collapsed;
    }

    let mut title = collapsed
        .chars()
        .take(AUTO_TITLE_MAX_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string();
    title.push('…');
    title
}

/// Process-wide marker for the generation that may need resuming after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationPointer {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub started_at_unix_millis: u64,
}

impl GenerationPointer {
    pub fn new(
        message_id: MessageId,
        conversation_id: ConversationId,
        started_at_unix_millis: u64,
    ) -> Self {
        Self {
            message_id,
            conversation_id,
            started_at_unix_millis,
        }
    }

    pub fn is_stale(&self, now_unix_millis: u64, ttl: Duration) -> bool {
        let age = now_unix_millis.saturating_sub(self.started_at_unix_millis);
        u128::from(age) > ttl.as_millis()
    }
}

pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

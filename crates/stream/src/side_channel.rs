use std::collections::HashMap;

use murmur_storage::MessageId;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Progress,
    Tool,
}

/// Latest status line reported for a generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub kind: StatusKind,
    pub action: String,
    pub detail: String,
}

impl StatusUpdate {
    pub fn progress(action: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Progress,
            action: action.into(),
            detail: description.into(),
        }
    }

    pub fn tool(action: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Tool,
            action: action.into(),
            detail: status.into(),
        }
    }
}

/// Per-message thinking text and status, kept in memory only.
#[derive(Debug, Default)]
pub struct SideChannels {
    thinking: Mutex<HashMap<MessageId, String>>,
    status: Mutex<HashMap<MessageId, StatusUpdate>>,
}

impl SideChannels {
    /// Appends verbatim and returns the accumulated thinking text.
    pub fn append_thinking(&self, message_id: &MessageId, chunk: &str) -> String {
        let mut thinking = self.thinking.lock();
        let text = thinking.entry(message_id.clone()).or_default();
        text.push_str(chunk);
        text.clone()
    }

    pub fn thinking(&self, message_id: &MessageId) -> Option<String> {
        self.thinking.lock().get(message_id).cloned()
    }

    pub fn set_status(&self, message_id: &MessageId, status: StatusUpdate) {
        self.status.lock().insert(message_id.clone(), status);
    }

    pub fn status(&self, message_id: &MessageId) -> Option<StatusUpdate> {
        self.status.lock().get(message_id).cloned()
    }

    pub fn clear_status(&self, message_id: &MessageId) {
        self.status.lock().remove(message_id);
    }

    pub fn clear_all(&self) {
        self.thinking.lock().clear();
        self.status.lock().clear();
    }
}

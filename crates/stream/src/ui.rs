use murmur_storage::{ConversationId, MessageId};
use tokio::sync::mpsc;

use crate::side_channel::StatusUpdate;

/// Flags a rendering layer binds its spinner, input lock and status line to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiFlags {
    pub loading: bool,
    pub streaming: bool,
    pub status: Option<StatusUpdate>,
    pub current_message_id: Option<MessageId>,
}

impl UiFlags {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    SessionStarted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    /// The assistant message now exists in the store; scroll it into view.
    MessageInserted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    CharacterDisplayed {
        message_id: MessageId,
        character: char,
    },
    ThinkingUpdated {
        message_id: MessageId,
        thinking: String,
    },
    StatusChanged {
        message_id: MessageId,
        status: Option<StatusUpdate>,
    },
    SessionFinished {
        message_id: MessageId,
    },
}

/// Fire-and-forget event sink; a missing or closed receiver is not an error.
#[derive(Debug, Clone, Default)]
pub struct UiNotifier {
    tx: Option<mpsc::UnboundedSender<UiEvent>>,
}

impl UiNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: UiEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

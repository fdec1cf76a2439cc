use std::sync::Arc;
use std::time::Duration;

use murmur_storage::{
    ConversationId, ConversationStore, Message, MessageId, StorageError, StorageResult,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::ui::{UiEvent, UiNotifier};

pub const DEFAULT_CHAR_DELAY: Duration = Duration::from_millis(10);

/// Producer half of the display queue. Dropping it lets the scheduler finish.
#[derive(Debug)]
pub struct DisplayFeed {
    tx: mpsc::UnboundedSender<char>,
}

impl DisplayFeed {
    /// Enqueues every character of `text` in order and returns how many were queued.
    pub fn push_str(&self, text: &str) -> usize {
        let mut queued = 0;
        for character in text.chars() {
            if self.tx.send(character).is_err() {
                break;
            }
            queued += 1;
        }
        queued
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayOutcome {
    pub displayed_content: String,
    pub message_added: bool,
}

/// Paced single consumer of the display queue, writing through to the store.
pub struct DisplayScheduler {
    store: Arc<dyn ConversationStore>,
    conversation_id: ConversationId,
    message_id: MessageId,
    char_delay: Duration,
    notifier: UiNotifier,
    queue: mpsc::UnboundedReceiver<char>,
    displayed_content: String,
    message_added: bool,
    // Content already stored under `message_id`; writes wait until the reveal passes it.
    saved_content: Option<String>,
}

/// Builds the queue for one message. `saved_content` is what the store already holds
/// for `message_id`, if anything.
pub fn display_channel(
    store: Arc<dyn ConversationStore>,
    conversation_id: ConversationId,
    message_id: MessageId,
    char_delay: Duration,
    notifier: UiNotifier,
    saved_content: Option<String>,
) -> (DisplayFeed, DisplayScheduler) {
    let (tx, queue) = mpsc::unbounded_channel();
    let scheduler = DisplayScheduler {
        store,
        conversation_id,
        message_id,
        char_delay,
        notifier,
        queue,
        displayed_content: String::new(),
        message_added: saved_content.is_some(),
        saved_content,
    };
    (DisplayFeed { tx }, scheduler)
}

/// Reads the stored content of one message without blocking the async runtime.
pub async fn load_saved_content(
    store: Arc<dyn ConversationStore>,
    conversation_id: ConversationId,
    message_id: MessageId,
) -> StorageResult<Option<String>> {
    on_blocking_pool("display-load-saved", move || {
        Ok(store
            .get_conversation(&conversation_id)?
            .and_then(|conversation| {
                conversation
                    .message(&message_id)
                    .map(|message| message.content.clone())
            }))
    })
    .await
}

impl DisplayScheduler {
    /// Waits for the gate, then drains one character per tick until the feed is dropped
    /// and the queue is empty.
    pub async fn run(mut self, mut gate: watch::Receiver<bool>) -> StorageResult<DisplayOutcome> {
        let opened = gate.wait_for(|open| *open).await.is_ok();
        if !opened {
            tracing::debug!(
                message_id = %self.message_id,
                "display gate dropped before opening; draining immediately"
            );
        }

        while let Some(character) = self.queue.recv().await {
            let next_tick = Instant::now() + self.char_delay;
            self.display(character).await?;
            tokio::time::sleep_until(next_tick).await;
        }

        Ok(DisplayOutcome {
            displayed_content: self.displayed_content,
            message_added: self.message_added,
        })
    }

    async fn display(&mut self, character: char) -> StorageResult<()> {
        self.displayed_content.push(character);

        // The store already holds this text and more; rewriting it would shorten it.
        if !self.covered_by_saved_content() {
            if self.message_added {
                self.saved_content = None;
                self.write_content().await?;
            } else if !self.displayed_content.trim().is_empty() {
                self.insert_message().await?;
            }
        }

        self.notifier.emit(UiEvent::CharacterDisplayed {
            message_id: self.message_id.clone(),
            character,
        });
        Ok(())
    }

    fn covered_by_saved_content(&self) -> bool {
        self.saved_content.as_deref().is_some_and(|saved| {
            saved.len() > self.displayed_content.len()
                && saved.starts_with(&self.displayed_content)
        })
    }

    async fn insert_message(&mut self) -> StorageResult<()> {
        let store = self.store.clone();
        let conversation_id = self.conversation_id.clone();
        let message = Message::assistant(self.message_id.clone(), self.displayed_content.clone());
        on_blocking_pool("display-insert-message", move || {
            store.add_message(&conversation_id, message)
        })
        .await?;

        self.message_added = true;
        tracing::debug!(
            conversation_id = %self.conversation_id,
            message_id = %self.message_id,
            "assistant message inserted"
        );
        self.notifier.emit(UiEvent::MessageInserted {
            conversation_id: self.conversation_id.clone(),
            message_id: self.message_id.clone(),
        });
        Ok(())
    }

    async fn write_content(&self) -> StorageResult<()> {
        let store = self.store.clone();
        let conversation_id = self.conversation_id.clone();
        let message_id = self.message_id.clone();
        let content = self.displayed_content.clone();
        on_blocking_pool("display-update-message", move || {
            store.update_message_content(&conversation_id, &message_id, &content)
        })
        .await
    }
}

// Store calls are synchronous and may touch disk; keep them off the async workers.
async fn on_blocking_pool<T, F>(stage: &'static str, call: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => result,
        Err(error) => {
            tracing::error!(stage, error = %error, "store call did not complete");
            Err(StorageError::WorkerPanicked { stage })
        }
    }
}

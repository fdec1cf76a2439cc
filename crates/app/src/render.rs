use std::io::{self, Write};

use murmur_storage::MessageId;
use murmur_stream::{StatusKind, StatusUpdate, UiEvent};
use tokio::sync::mpsc;

pub const ASSISTANT_PREFIX: &str = "assistant> ";

/// Terminal rendering layer: revealed characters go to `out`, side-channel text to `aside`.
pub struct TerminalRenderer<W, A> {
    out: W,
    aside: A,
    current: Option<MessageId>,
    thinking_shown: usize,
}

impl<W: Write, A: Write> TerminalRenderer<W, A> {
    pub fn new(out: W, aside: A) -> Self {
        Self {
            out,
            aside,
            current: None,
            thinking_shown: 0,
        }
    }

    /// Renders events until every notifier clone is dropped.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<UiEvent>) -> io::Result<Self> {
        while let Some(event) = events.recv().await {
            self.handle(&event)?;
        }
        Ok(self)
    }

    pub fn handle(&mut self, event: &UiEvent) -> io::Result<()> {
        match event {
            UiEvent::SessionStarted { message_id, .. } => {
                tracing::debug!(message_id = %message_id, "rendering session");
                self.thinking_shown = 0;
            }
            UiEvent::MessageInserted { .. } => {}
            UiEvent::CharacterDisplayed {
                message_id,
                character,
            } => {
                if self.current.as_ref() != Some(message_id) {
                    self.out.write_all(ASSISTANT_PREFIX.as_bytes())?;
                    self.current = Some(message_id.clone());
                }
                let mut encoded = [0_u8; 4];
                self.out
                    .write_all(character.encode_utf8(&mut encoded).as_bytes())?;
                self.out.flush()?;
            }
            UiEvent::ThinkingUpdated { thinking, .. } => {
                let Some(delta) = thinking.get(self.thinking_shown..) else {
                    return Ok(());
                };
                if delta.is_empty() {
                    return Ok(());
                }
                if self.thinking_shown == 0 {
                    self.aside.write_all(b"thinking: ")?;
                }
                self.aside.write_all(delta.as_bytes())?;
                self.aside.flush()?;
                self.thinking_shown = thinking.len();
            }
            UiEvent::StatusChanged {
                status: Some(status),
                ..
            } => {
                if self.thinking_shown > 0 {
                    self.aside.write_all(b"\n")?;
                    self.thinking_shown = 0;
                }
                writeln!(self.aside, "{}", status_line(status))?;
            }
            UiEvent::StatusChanged { status: None, .. } => {}
            UiEvent::SessionFinished { message_id } => {
                if self.thinking_shown > 0 {
                    self.aside.write_all(b"\n")?;
                    self.thinking_shown = 0;
                }
                if self.current.as_ref() == Some(message_id) {
                    self.out.write_all(b"\n")?;
                    self.out.flush()?;
                    self.current = None;
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn into_parts(self) -> (W, A) {
        (self.out, self.aside)
    }
}

fn status_line(status: &StatusUpdate) -> String {
    let label = match status.kind {
        StatusKind::Progress => "status",
        StatusKind::Tool => "tool",
    };
    if status.detail.is_empty() {
        format!("[{label}] {}", status.action)
    } else {
        format!("[{label}] {}: {}", status.action, status.detail)
    }
}

use murmur_storage::MessageId;
use serde::Deserialize;

/// One decoded `data:` frame of a generation stream.
///
/// The wire form is a JSON object tagged by its `type` field. Tags this client does not
/// know deserialize to [`StreamEvent::Unknown`] and are dropped by the frame decoder.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Init {
        #[serde(default, rename = "messageId")]
        message_id: Option<MessageId>,
        #[serde(default, rename = "existingContent")]
        existing_content: Option<String>,
    },
    Status {
        action: String,
        description: String,
    },
    ToolStatus {
        action: String,
        status: String,
    },
    ThinkingChunk {
        content: String,
    },
    /// Legacy full thinking block, appended like a chunk.
    Thinking {
        content: String,
    },
    Content {
        content: String,
    },
    Complete {},
    Error {
        error: String,
    },
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Status { .. } => "status",
            Self::ToolStatus { .. } => "tool_status",
            Self::ThinkingChunk { .. } => "thinking_chunk",
            Self::Thinking { .. } => "thinking",
            Self::Content { .. } => "content",
            Self::Complete {} => "complete",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

pub mod client;
pub mod controller;
pub mod display;
pub mod event;
pub mod frame;
pub mod phase;
pub mod retry;
pub mod side_channel;
pub mod transport;
pub mod ui;

#[cfg(test)]
mod testing;

pub use client::{ChatClient, ClientError, ClientResult, Endpoints};
pub use controller::{
    AttachOutcome, DEFAULT_SKELETON_DELAY, SessionController, SessionError, SessionResult,
    SessionSummary, StreamConfig, StreamSource,
};
pub use display::{
    DEFAULT_CHAR_DELAY, DisplayFeed, DisplayOutcome, DisplayScheduler, load_saved_content,
};
pub use event::StreamEvent;
pub use frame::{DEFAULT_MAX_LINE_BYTES, FrameDecoder, FrameError, FrameReader, FrameResult};
pub use phase::{PhaseRejection, SessionPhase};
pub use retry::{FailureKind, RetryPolicy};
pub use side_channel::{SideChannels, StatusKind, StatusUpdate};
pub use transport::{
    BoxFuture, ByteStream, GenerationTransport, HttpTransport, TransportError, TransportResponse,
    TransportResult,
};
pub use ui::{UiEvent, UiFlags, UiNotifier};

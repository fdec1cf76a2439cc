/// Lifecycle of one attached stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    AwaitingFirstContent,
    Displaying,
    Draining,
    Finalized,
}

/// Rejection reason for an illegal phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseRejection {
    pub from: SessionPhase,
    pub to: SessionPhase,
}

pub type PhaseResult = Result<SessionPhase, PhaseRejection>;

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingFirstContent => "awaiting-first-content",
            Self::Displaying => "displaying",
            Self::Draining => "draining",
            Self::Finalized => "finalized",
        }
    }

    /// Applies one transition deterministically.
    ///
    /// Phases only move forward. `AwaitingFirstContent` may skip straight to `Draining`
    /// when the body ends before the display gate opens, and every phase may finalize.
    pub fn advance(self, next: SessionPhase) -> PhaseResult {
        let allowed = match (self, next) {
            (_, Self::Finalized) => true,
            (Self::Idle, Self::Connecting)
            | (Self::Connecting, Self::AwaitingFirstContent)
            | (Self::AwaitingFirstContent, Self::Displaying)
            | (Self::AwaitingFirstContent, Self::Draining)
            | (Self::Displaying, Self::Draining) => true,
            _ => false,
        };

        if allowed {
            Ok(next)
        } else {
            Err(PhaseRejection {
                from: self,
                to: next,
            })
        }
    }
}

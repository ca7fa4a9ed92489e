use fold_llm::{ErrorKind, TurnId};

use crate::chat::message::StreamTransition;

/// Why a turn ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The backend reported an error event.
    Stream(ErrorKind),
    /// The turn-initiation call itself failed.
    Initiation,
    /// No event arrived within the idle timeout.
    Timeout,
    /// The channel closed before a terminal event.
    ChannelClosed,
}

/// Recorded result of a closed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    /// `end` arrived with an empty history: nothing was produced.
    NoContent,
    /// The backend reported the turn as interrupted.
    Interrupted,
    /// The client dropped the event stream before a terminal event.
    Detached,
    Failed(FailureCause),
}

impl TurnOutcome {
    /// Returns the terminal lifecycle transition for this outcome.
    pub fn transition(self, turn: TurnId) -> StreamTransition {
        match self {
            Self::Completed | Self::NoContent => StreamTransition::Complete(turn),
            Self::Interrupted | Self::Detached => StreamTransition::Interrupt(turn),
            Self::Failed(_) => StreamTransition::Fail(turn),
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Result of handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnProgress {
    Open,
    Closed(TurnOutcome),
    /// The event belonged to a turn that is no longer streaming.
    Ignored,
}

impl TurnProgress {
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

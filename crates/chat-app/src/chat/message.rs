use fold_llm::TurnId;

use crate::chat::classifier::ErrorAnnotation;
use crate::chat::tool_activity::ToolNotice;

/// Who a displayed message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    User,
    Assistant,
    System,
}

/// Visual grouping of a message among its same-sender neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    Start,
    Middle,
    End,
    Singleton,
}

impl Position {
    pub const fn from_neighbors(same_as_previous: bool, same_as_next: bool) -> Self {
        match (same_as_previous, same_as_next) {
            (false, false) => Self::Singleton,
            (false, true) => Self::Start,
            (true, true) => Self::Middle,
            (true, false) => Self::End,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warn,
    Info,
    Nothing,
}

/// Short status label rendered under a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusNote {
    pub label: String,
    pub severity: Severity,
}

impl StatusNote {
    pub fn new(label: impl Into<String>, severity: Severity) -> Self {
        Self {
            label: label.into(),
            severity,
        }
    }

    /// The backend reported that the turn was cut short.
    pub fn interrupted() -> Self {
        Self::new("Interrupted", Severity::Nothing)
    }

    /// The turn could not be started at all.
    pub fn internal_error() -> Self {
        Self::new("Internal error", Severity::Error)
    }
}

/// Mutable part of a message. Everything reachable from here can change without
/// affecting grouping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageContent {
    pub text: String,
    /// Streamed reasoning, rendered as its own block and never merged into `text`.
    pub reasoning: String,
    pub tool_notices: Vec<ToolNotice>,
    pub status_note: Option<StatusNote>,
    pub error: Option<ErrorAnnotation>,
}

impl MessageContent {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
            && self.reasoning.is_empty()
            && self.tool_notices.is_empty()
            && self.status_note.is_none()
            && self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    sender: Sender,
    content: MessageContent,
    position: Position,
    finalized: bool,
}

impl ChatMessage {
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            sender,
            content: MessageContent {
                text: text.into(),
                ..MessageContent::default()
            },
            position: Position::Singleton,
            finalized: false,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text)
    }

    /// Creates an empty assistant message that the active turn fills in.
    pub fn assistant() -> Self {
        Self::new(Sender::Assistant, String::new())
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Sender::System, text)
    }

    pub fn sender(&self) -> Sender {
        self.sender
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }

    pub fn text(&self) -> &str {
        &self.content.text
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub(crate) fn content_mut(&mut self) -> &mut MessageContent {
        &mut self.content
    }

    pub(crate) fn set_position(&mut self, position: Position) {
        self.position = position;
    }

    pub(crate) fn finalize(&mut self) -> bool {
        !std::mem::replace(&mut self.finalized, true)
    }
}

/// Turn lifecycle of the controller.
///
/// Terminal states are transient: the controller records the outcome and resets to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Submitting(TurnId),
    Streaming(TurnId),
    Completed(TurnId),
    Interrupted(TurnId),
    Failed(TurnId),
}

/// State transition input for the turn lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransition {
    Submit(TurnId),
    Attach(TurnId),
    Complete(TurnId),
    Interrupt(TurnId),
    Fail(TurnId),
    ResetToIdle,
}

/// Rejection reason for illegal turn transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyActive { active: TurnId, attempted: TurnId },
    NoActiveTurn,
    TurnMismatch { active: TurnId, attempted: TurnId },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    /// Returns the open turn while submitting or streaming.
    pub fn active_turn(&self) -> Option<TurnId> {
        match self {
            Self::Submitting(turn) | Self::Streaming(turn) => Some(*turn),
            Self::Idle | Self::Completed(_) | Self::Interrupted(_) | Self::Failed(_) => None,
        }
    }

    /// Returns true when an incoming event belongs to the streaming turn.
    pub fn accepts_stream_event(&self, turn: TurnId) -> bool {
        matches!(self, Self::Streaming(active) if *active == turn)
    }

    /// Applies one transition deterministically.
    ///
    /// A new turn may only be submitted while no other turn is open. Every other transition
    /// must name the open turn exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Submit(turn) => self.apply_submit(turn),
            StreamTransition::Attach(turn) => match self {
                Self::Submitting(active) if *active == turn => Ok(Self::Streaming(turn)),
                _ => Err(self.mismatch(turn)),
            },
            StreamTransition::Complete(turn) => match self {
                Self::Streaming(active) if *active == turn => Ok(Self::Completed(turn)),
                _ => Err(self.mismatch(turn)),
            },
            StreamTransition::Interrupt(turn) => match self {
                Self::Streaming(active) if *active == turn => Ok(Self::Interrupted(turn)),
                _ => Err(self.mismatch(turn)),
            },
            StreamTransition::Fail(turn) => match self {
                Self::Submitting(active) | Self::Streaming(active) if *active == turn => {
                    Ok(Self::Failed(turn))
                }
                _ => Err(self.mismatch(turn)),
            },
            StreamTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_submit(&self, turn: TurnId) -> StreamTransitionResult {
        match self.active_turn() {
            Some(active) => Err(StreamTransitionRejection::AlreadyActive {
                active,
                attempted: turn,
            }),
            None => Ok(Self::Submitting(turn)),
        }
    }

    fn mismatch(&self, attempted: TurnId) -> StreamTransitionRejection {
        match self.active_turn() {
            Some(active) => StreamTransitionRejection::TurnMismatch { active, attempted },
            None => StreamTransitionRejection::NoActiveTurn,
        }
    }
}

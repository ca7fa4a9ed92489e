/// Error payload classification into user-facing annotations.
pub mod classifier;
/// Turn controller driving the store from backend events.
pub mod controller;
/// Turn outcomes and per-event progress.
pub mod events;
/// Domain entities and deterministic stream state boundaries.
pub mod message;
pub mod message_list;
pub mod scroll_manager;
pub mod tool_activity;

pub use classifier::{ErrorAnnotation, Recovery, classify};
pub use controller::{
    DEFAULT_TURN_TIMEOUT, ServiceError, StreamController, StreamTurn, SubmitError,
};
pub use events::{FailureCause, TurnOutcome, TurnProgress};
pub use message::{
    ChatMessage, MessageContent, Position, Sender, Severity, StatusNote, StreamState,
    StreamTransition, StreamTransitionRejection, StreamTransitionResult,
};
pub use message_list::{
    ChangeKind, MessageStore, StoreChange, StoreError, StoreObserver, StoreResult, SubscriptionId,
};
pub use scroll_manager::{
    ANNOTATION_FOLLOW_THRESHOLD_PX, FollowCoordinator, FollowThresholds,
    TEXT_FOLLOW_THRESHOLD_PX, Viewport, should_follow,
};
pub use tool_activity::{ToolActivityTracker, ToolNotice};

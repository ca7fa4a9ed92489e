use std::sync::Arc;
use std::time::Duration;

use fold_llm::{
    BackendError, HistoryMessage, ProviderConfig, StreamEnd, StreamError, StreamEvent,
    ToolActivity, TurnBackend, TurnEvent, TurnEventStream, TurnHandle, TurnId, TurnRequest,
};
use snafu::{ResultExt, Snafu, ensure};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::chat::classifier::{ErrorAnnotation, classify};
use crate::chat::events::{FailureCause, TurnOutcome, TurnProgress};
use crate::chat::message::{
    ChatMessage, MessageContent, StatusNote, StreamState, StreamTransition,
};
use crate::chat::message_list::{ChangeKind, MessageStore};
use crate::chat::tool_activity::ToolActivityTracker;

/// Idle time allowed between two events of an open turn.
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(120);

const SERVICE_RESET_NOTICE: &str = "Service configuration reset";
const CHANNEL_CLOSED_DETAIL: &str = "stream ended before a terminal event";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SubmitError {
    #[snafu(display("a response is already in progress ({active:?})"))]
    TurnInProgress { stage: &'static str, active: TurnId },
    #[snafu(display("cannot submit an empty prompt"))]
    EmptyPrompt { stage: &'static str },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ServiceError {
    #[snafu(display("backend call failed on `{stage}`, {source}"))]
    Backend {
        stage: &'static str,
        source: BackendError,
    },
}

/// One assistant response in flight.
pub struct StreamTurn {
    id: TurnId,
    target_message_index: Option<usize>,
    accumulated_text: String,
    accumulated_reasoning: String,
    tools: ToolActivityTracker,
    stream: TurnEventStream,
    deferred: Option<TurnEvent>,
    worker: Option<JoinHandle<()>>,
    last_event_at: Instant,
}

impl StreamTurn {
    fn new(stream: TurnEventStream, worker: JoinHandle<()>) -> Self {
        Self {
            id: stream.turn(),
            target_message_index: None,
            accumulated_text: String::new(),
            accumulated_reasoning: String::new(),
            tools: ToolActivityTracker::new(),
            stream,
            deferred: None,
            worker: Some(worker),
            last_event_at: Instant::now(),
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    /// Store index of the assistant message, once the turn has produced content.
    pub fn target_message_index(&self) -> Option<usize> {
        self.target_message_index
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn accumulated_reasoning(&self) -> &str {
        &self.accumulated_reasoning
    }

    pub fn tools(&self) -> &ToolActivityTracker {
        &self.tools
    }
}

/// Streamed text channel of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delta {
    Reply,
    Reasoning,
}

impl Delta {
    fn fragment(self, event: &StreamEvent) -> Option<&str> {
        match (self, event) {
            (Self::Reply, StreamEvent::Push(text))
            | (Self::Reasoning, StreamEvent::Reason(text)) => Some(text),
            _ => None,
        }
    }
}

enum NextEvent {
    Event(TurnEvent),
    Closed,
    TimedOut,
}

/// Drives one conversation: submits turns, consumes their events in order and keeps the
/// message store and the committed history in sync.
pub struct StreamController {
    backend: Arc<dyn TurnBackend>,
    store: MessageStore,
    state: StreamState,
    turn: Option<StreamTurn>,
    retired_worker: Option<JoinHandle<()>>,
    history: Vec<HistoryMessage>,
    last_outcome: Option<TurnOutcome>,
    next_turn_id: u64,
    turn_timeout: Option<Duration>,
}

impl StreamController {
    pub fn new(backend: Arc<dyn TurnBackend>) -> Self {
        Self {
            backend,
            store: MessageStore::new(),
            state: StreamState::Idle,
            turn: None,
            retired_worker: None,
            history: Vec::new(),
            last_outcome: None,
            next_turn_id: 1,
            turn_timeout: Some(DEFAULT_TURN_TIMEOUT),
        }
    }

    /// `None` waits for events indefinitely.
    pub fn with_turn_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn set_turn_timeout(&mut self, timeout: Option<Duration>) {
        self.turn_timeout = timeout;
    }

    pub fn turn_timeout(&self) -> Option<Duration> {
        self.turn_timeout
    }

    pub fn phase(&self) -> StreamState {
        self.state
    }

    pub fn active_turn(&self) -> Option<TurnId> {
        self.state.active_turn()
    }

    pub fn current_turn(&self) -> Option<&StreamTurn> {
        self.turn.as_ref()
    }

    pub fn last_outcome(&self) -> Option<TurnOutcome> {
        self.last_outcome
    }

    /// Authoritative history as last committed by an `end` event.
    pub fn history(&self) -> &[HistoryMessage] {
        &self.history
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MessageStore {
        &mut self.store
    }

    /// Appends the user's message and opens a new turn for it.
    ///
    /// A backend that cannot start the turn closes it right away as an internal error;
    /// the returned id then refers to an already failed turn.
    pub fn submit(&mut self, text: &str) -> Result<TurnId, SubmitError> {
        if let Some(active) = self.state.active_turn() {
            return TurnInProgressSnafu {
                stage: "submit",
                active,
            }
            .fail();
        }
        ensure!(!text.trim().is_empty(), EmptyPromptSnafu { stage: "submit" });

        let turn = TurnId::new(self.next_turn_id);
        self.next_turn_id += 1;
        self.transition(StreamTransition::Submit(turn));
        self.store.append(ChatMessage::user(text));

        match self.backend.start_turn(TurnRequest::new(turn, text)) {
            Ok(TurnHandle { stream, worker }) => {
                let worker = tokio::spawn(worker);
                self.transition(StreamTransition::Attach(turn));
                self.turn = Some(StreamTurn::new(stream, worker));
                tracing::debug!(turn = ?turn, "turn attached");
            }
            Err(error) => {
                tracing::error!(turn = ?turn, error = %error, "failed to start turn");
                let mut message = ChatMessage::assistant();
                message.content_mut().status_note = Some(StatusNote::internal_error());
                let index = self.store.append(message);
                if let Err(error) = self.store.close(index) {
                    tracing::warn!(index, error = %error, "failed to close message");
                }
                self.transition(StreamTransition::Fail(turn));
                self.transition(StreamTransition::ResetToIdle);
                self.last_outcome = Some(TurnOutcome::Failed(FailureCause::Initiation));
            }
        }

        Ok(turn)
    }

    /// Waits for the next event of the open turn and handles it.
    ///
    /// Returns `None` when no turn is open. Cancel safe: dropping the future before it
    /// resolves loses no event.
    pub async fn pump(&mut self) -> Option<TurnProgress> {
        let next = self.next_event().await?;
        let progress = match next {
            NextEvent::Event(event) => self.handle_event(event),
            NextEvent::Closed => {
                tracing::warn!(turn = ?self.active_turn(), "turn stream closed without a terminal event");
                self.fail_turn(
                    FailureCause::ChannelClosed,
                    ErrorAnnotation::failure(CHANNEL_CLOSED_DETAIL),
                )
            }
            NextEvent::TimedOut => {
                let limit = self.turn_timeout.unwrap_or_default();
                tracing::warn!(turn = ?self.active_turn(), timeout = ?limit, "turn timed out waiting for events");
                self.abandon_worker();
                // The worker may hold the backend's turn slot until it is dropped.
                self.settle_retired_worker().await;
                self.fail_turn(
                    FailureCause::Timeout,
                    ErrorAnnotation::failure(format!(
                        "no response within {} seconds",
                        limit.as_secs()
                    )),
                )
            }
        };
        Some(progress)
    }

    /// Pumps the open turn until it closes.
    pub async fn run_turn(&mut self) -> Option<TurnOutcome> {
        loop {
            if let TurnProgress::Closed(outcome) = self.pump().await? {
                return Some(outcome);
            }
        }
    }

    async fn next_event(&mut self) -> Option<NextEvent> {
        let timeout = self.turn_timeout;
        let turn = self.turn.as_mut()?;
        if let Some(event) = turn.deferred.take() {
            return Some(NextEvent::Event(event));
        }

        let received = match timeout {
            Some(limit) => {
                let deadline = turn.last_event_at + limit;
                match tokio::time::timeout_at(deadline, turn.stream.recv()).await {
                    Ok(received) => received,
                    Err(_) => return Some(NextEvent::TimedOut),
                }
            }
            None => turn.stream.recv().await,
        };
        turn.last_event_at = Instant::now();

        Some(received.map_or(NextEvent::Closed, NextEvent::Event))
    }

    /// Applies one event to the open turn. Events of any other turn are ignored.
    pub fn handle_event(&mut self, event: TurnEvent) -> TurnProgress {
        if !self.state.accepts_stream_event(event.turn) {
            tracing::debug!(
                turn = ?event.turn,
                active = ?self.active_turn(),
                "dropped event for a turn that is not streaming"
            );
            return TurnProgress::Ignored;
        }

        match event.event {
            StreamEvent::Push(text) => {
                self.apply_delta(Delta::Reply, text);
                TurnProgress::Open
            }
            StreamEvent::Reason(text) => {
                self.apply_delta(Delta::Reasoning, text);
                TurnProgress::Open
            }
            StreamEvent::Tool(activity) => {
                self.apply_tool(activity);
                TurnProgress::Open
            }
            StreamEvent::End(end) => self.apply_end(end),
            StreamEvent::Error(error) => self.apply_error(error),
        }
    }

    fn apply_delta(&mut self, delta: Delta, first: String) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };

        // Coalesce a queued burst into one store mutation. The first event that is not a
        // fragment of the same channel and turn is kept for the next pump.
        let mut text = first;
        while let Some(next) = turn.stream.try_recv() {
            if next.turn == turn.id
                && let Some(more) = delta.fragment(&next.event)
            {
                text.push_str(more);
                continue;
            }
            turn.deferred = Some(next);
            break;
        }

        if text.is_empty() {
            return;
        }

        match delta {
            Delta::Reply => {
                turn.accumulated_text.push_str(&text);
                Self::update_target(&mut self.store, turn, ChangeKind::Text, |content| {
                    content.text.push_str(&text);
                });
            }
            Delta::Reasoning => {
                turn.accumulated_reasoning.push_str(&text);
                Self::update_target(&mut self.store, turn, ChangeKind::Text, |content| {
                    content.reasoning.push_str(&text);
                });
            }
        }
    }

    fn apply_tool(&mut self, activity: ToolActivity) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };

        let notice = turn.tools.record(activity);
        tracing::debug!(turn = ?turn.id, tool = %notice.name, state = %notice.state, "tool activity");
        Self::update_target(&mut self.store, turn, ChangeKind::Annotation, |content| {
            content.tool_notices.push(notice);
        });
    }

    fn apply_end(&mut self, end: StreamEnd) -> TurnProgress {
        if end.messages.is_empty() {
            return self.finish_turn(TurnOutcome::NoContent);
        }

        self.history = end.messages;
        if !end.interrupted {
            return self.finish_turn(TurnOutcome::Completed);
        }

        if let Some(turn) = self.turn.as_mut() {
            Self::update_target(&mut self.store, turn, ChangeKind::Annotation, |content| {
                content.status_note = Some(StatusNote::interrupted());
            });
        }
        self.finish_turn(TurnOutcome::Interrupted)
    }

    fn apply_error(&mut self, error: StreamError) -> TurnProgress {
        let cause = FailureCause::Stream(error.kind);
        let annotation = classify(&error);
        if annotation.is_inline() {
            tracing::info!(turn = ?self.active_turn(), kind = ?error.kind, "turn failed");
            return self.fail_turn(cause, annotation);
        }

        tracing::warn!(
            turn = ?self.active_turn(),
            kind = ?error.kind,
            annotation = %annotation,
            "backend payload could not be decoded"
        );
        self.finish_turn(TurnOutcome::Failed(cause))
    }

    fn fail_turn(&mut self, cause: FailureCause, annotation: ErrorAnnotation) -> TurnProgress {
        if let Some(turn) = self.turn.as_mut() {
            Self::update_target(&mut self.store, turn, ChangeKind::Annotation, |content| {
                content.error = Some(annotation);
            });
        }
        self.finish_turn(TurnOutcome::Failed(cause))
    }

    /// Writes into the turn's assistant message, creating it with the update already
    /// applied when the turn has not shown anything yet.
    fn update_target<F>(store: &mut MessageStore, turn: &mut StreamTurn, kind: ChangeKind, update: F)
    where
        F: FnOnce(&mut MessageContent),
    {
        match turn.target_message_index {
            Some(index) => {
                if let Err(error) = store.mutate(index, kind, update) {
                    tracing::warn!(turn = ?turn.id, error = %error, "failed to update assistant message");
                }
            }
            None => {
                let mut message = ChatMessage::assistant();
                update(message.content_mut());
                turn.target_message_index = Some(store.append(message));
            }
        }
    }

    fn finish_turn(&mut self, outcome: TurnOutcome) -> TurnProgress {
        let Some(turn) = self.turn.take() else {
            return TurnProgress::Closed(outcome);
        };

        if let Some(index) = turn.target_message_index
            && let Err(error) = self.store.close(index)
        {
            tracing::warn!(turn = ?turn.id, index, error = %error, "failed to close message");
        }

        self.transition(outcome.transition(turn.id));
        self.transition(StreamTransition::ResetToIdle);
        self.last_outcome = Some(outcome);
        tracing::info!(turn = ?turn.id, outcome = ?outcome, "turn closed");
        TurnProgress::Closed(outcome)
    }

    fn transition(&mut self, transition: StreamTransition) {
        match self.state.apply(transition) {
            Ok(next) => self.state = next,
            Err(rejection) => {
                tracing::warn!(?transition, ?rejection, state = ?self.state, "rejected stream transition");
            }
        }
    }

    /// Asks the backend to stop generating. The turn stays attached so the backend's own
    /// `end` decides how it is rendered.
    pub fn stop(&mut self) -> bool {
        let Some(turn) = self.turn.as_mut() else {
            return false;
        };
        let delivered = turn.stream.request_stop();
        tracing::info!(turn = ?turn.id, delivered, "requested stop");
        delivered
    }

    /// Drops the open turn's event stream and closes it as interrupted. Partial text is
    /// kept as is, without a status note.
    pub fn detach(&mut self) -> bool {
        if self.turn.is_none() {
            return false;
        }
        self.abandon_worker();
        self.finish_turn(TurnOutcome::Detached);
        true
    }

    fn abandon_worker(&mut self) {
        if let Some(worker) = self.turn.as_mut().and_then(|turn| turn.worker.take()) {
            worker.abort();
            self.retired_worker = Some(worker);
        }
    }

    /// Waits until an aborted worker has been dropped. Cancel safe: the handle is only
    /// released once it resolved.
    async fn settle_retired_worker(&mut self) {
        if let Some(worker) = self.retired_worker.as_mut() {
            // An aborted worker resolves with a cancellation error.
            let _ = worker.await;
            self.retired_worker = None;
        }
    }

    pub async fn clear_conversation(&mut self) -> Result<(), ServiceError> {
        self.detach();
        self.settle_retired_worker().await;

        self.backend.clear_history().await.context(BackendSnafu {
            stage: "clear-history",
        })?;
        self.history.clear();
        self.store.clear();
        tracing::info!("cleared conversation");
        Ok(())
    }

    pub async fn reset_service(&mut self, config: ProviderConfig) -> Result<(), ServiceError> {
        self.detach();
        self.settle_retired_worker().await;

        self.backend.reset(config).await.context(BackendSnafu {
            stage: "reset-service",
        })?;
        self.history.clear();
        self.store.clear();
        self.store.append(ChatMessage::system(SERVICE_RESET_NOTICE));
        tracing::info!("reset service");
        Ok(())
    }
}

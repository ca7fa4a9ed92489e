use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::events::{HistoryMessage, Parameter, TurnEvent, TurnId};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Connection settings for the assistant service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model_name: String,
}

impl ProviderConfig {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            model_name: model_name.into().trim().to_string(),
        }
    }

    /// Lists the required fields that are blank, in declaration order.
    pub fn missing_parameters(&self) -> Vec<Parameter> {
        [
            (Parameter::Endpoint, &self.endpoint),
            (Parameter::ApiKey, &self.api_key),
            (Parameter::ModelName, &self.model_name),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(parameter, _)| parameter)
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub turn: TurnId,
    pub prompt: String,
}

impl TurnRequest {
    pub fn new(turn: TurnId, prompt: impl Into<String>) -> Self {
        Self {
            turn,
            prompt: prompt.into(),
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TurnWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("a turn is already streaming, rejected {turn:?}"))]
    TurnInProgress { stage: &'static str, turn: TurnId },
    #[snafu(display("turn {turn:?} has an empty prompt"))]
    EmptyPrompt { stage: &'static str, turn: TurnId },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

/// Receiving half of one turn's event channel.
///
/// Dropping the stream signals cancellation to the worker.
pub struct TurnEventStream {
    turn: TurnId,
    events: mpsc::UnboundedReceiver<TurnEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct TurnHandle {
    pub stream: TurnEventStream,
    pub worker: TurnWorker,
}

impl TurnEventStream {
    pub(crate) fn new(
        turn: TurnId,
        events: mpsc::UnboundedReceiver<TurnEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            turn,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn turn(&self) -> TurnId {
        self.turn
    }

    /// Waits for the next event. Cancel safe.
    pub async fn recv(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TurnEvent> {
        self.events.try_recv().ok()
    }

    /// Asks the worker to stop generating while keeping the channel open, so the
    /// worker can still report how the turn ended.
    pub fn request_stop(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn stop_requested(&self) -> bool {
        self.cancel_tx.is_none()
    }
}

impl Drop for TurnEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Event source for assistant turns plus the out-of-band service calls.
pub trait TurnBackend: Send + Sync {
    /// Starts a turn. Failing here means the turn never reached the service.
    fn start_turn(&self, request: TurnRequest) -> BackendResult<TurnHandle>;
    fn clear_history<'a>(&'a self) -> BoxFuture<'a, BackendResult<()>>;
    fn reset<'a>(&'a self, config: ProviderConfig) -> BoxFuture<'a, BackendResult<()>>;
    fn history<'a>(&'a self) -> BoxFuture<'a, Vec<HistoryMessage>>;
}

/// Builds a connected event channel for `turn`.
///
/// Returns the sender the worker emits through, the stream handed to the client, and the
/// receiver that fires when the client stops or detaches.
pub fn make_event_stream(
    turn: TurnId,
) -> (
    mpsc::UnboundedSender<TurnEvent>,
    TurnEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        TurnEventStream::new(turn, event_rx, cancel_tx),
        cancel_rx,
    )
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use futures::StreamExt;
use rig::completion::{CompletionError, CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{Mutex, mpsc, oneshot};

use super::events::{
    HistoryMessage, Role, StreamEnd, StreamError, StreamEvent, ToolActivity, TurnEvent, TurnId,
};
use super::provider::{
    BackendError, BackendResult, BoxFuture, CompletionsFailedSnafu, EmptyPromptSnafu,
    HttpClientSnafu, ProviderConfig, TurnBackend, TurnHandle, TurnInProgressSnafu, TurnRequest,
    TurnWorker, make_event_stream,
};

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// State reported on a tool notice when the model issues a call.
const TOOL_CALLED_STATE: &str = "called";

/// OpenAI-compatible backend that owns the authoritative history.
pub struct RigBackend {
    config: Arc<ArcSwap<ProviderConfig>>,
    history: Arc<Mutex<Vec<HistoryMessage>>>,
    streaming: Arc<AtomicBool>,
}

/// Clears the single-turn flag when the worker finishes or is dropped unpolled.
struct StreamingGuard(Arc<AtomicBool>);

impl Drop for StreamingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-turn bookkeeping shared by the worker loop.
struct WorkerState {
    reply: String,
    cancelled: bool,
    failure: Option<BackendError>,
}

impl RigBackend {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            history: Arc::new(Mutex::new(Vec::new())),
            streaming: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> Arc<ProviderConfig> {
        self.config.load_full()
    }

    fn build_client(config: &ProviderConfig) -> BackendResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &HistoryMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(history: &[HistoryMessage]) -> Option<String> {
        // Rig exposes a single preamble field, so system-role history entries are folded into it.
        let parts = history
            .iter()
            .filter(|message| message.role == Role::System && !message.content.trim().is_empty())
            .map(|message| message.content.clone())
            .collect::<Vec<_>>();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        history: &[HistoryMessage],
        prompt: &str,
    ) -> BackendResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(config.model_name.clone());

        let messages = history
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let mut builder = model
            .completion_request(RigMessage::user(prompt.to_string()))
            .messages(messages);

        if let Some(preamble) = Self::merged_preamble(history) {
            builder = builder.preamble(preamble);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    /// Maps a backend failure onto the wire error the client classifies.
    fn stream_error_for(config: &ProviderConfig, error: &BackendError) -> StreamError {
        match error {
            BackendError::CompletionsFailed {
                source: CompletionError::JsonError(source),
                ..
            } => StreamError::serialize(source.to_string()),
            other => StreamError::request_sending(format!("{} ({other})", config.endpoint)),
        }
    }

    fn emit(event_tx: &mpsc::UnboundedSender<TurnEvent>, turn: TurnId, event: StreamEvent) -> bool {
        event_tx.send(TurnEvent::new(turn, event)).is_ok()
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamEvent>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) => {
                if text.text.is_empty() {
                    return None;
                }
                Some(StreamEvent::Push(text.text))
            }
            StreamedAssistantContent::ToolCall { tool_call, .. } => Some(StreamEvent::Tool(
                ToolActivity::new(tool_call.function.name, TOOL_CALLED_STATE),
            )),
            StreamedAssistantContent::Reasoning(reasoning) => {
                // Rig can split reasoning into multiple fragments; flatten before forwarding.
                let text = reasoning.reasoning.join("");
                if text.is_empty() {
                    return None;
                }
                Some(StreamEvent::Reason(text))
            }
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
                if reasoning.is_empty() {
                    return None;
                }
                Some(StreamEvent::Reason(reasoning))
            }
            StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_turn_worker(
        config: Arc<ProviderConfig>,
        history: Arc<Mutex<Vec<HistoryMessage>>>,
        request: TurnRequest,
        event_tx: mpsc::UnboundedSender<TurnEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
        guard: StreamingGuard,
    ) {
        let turn = request.turn;

        let missing = config.missing_parameters();
        if !missing.is_empty() {
            tracing::warn!(turn = ?turn, ?missing, "service configuration is incomplete");
            drop(guard);
            Self::emit(
                &event_tx,
                turn,
                StreamEvent::Error(StreamError::empty_parameter(missing)),
            );
            return;
        }

        let prior = history.lock().await.clone();
        let mut stream = match Self::open_stream(&config, &prior, &request.prompt).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    turn = ?turn,
                    model_name = %config.model_name,
                    error = %error,
                    "failed to open assistant stream"
                );
                drop(guard);
                Self::emit(
                    &event_tx,
                    turn,
                    StreamEvent::Error(Self::stream_error_for(&config, &error)),
                );
                return;
            }
        };

        let mut state = WorkerState {
            reply: String::new(),
            cancelled: false,
            failure: None,
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    state.cancelled = true;
                    tracing::debug!(turn = ?turn, "assistant stream stopped by client");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            let Some(event) = Self::map_stream_item(item) else {
                                continue;
                            };
                            if let StreamEvent::Push(text) = &event {
                                state.reply.push_str(text);
                            }
                            if !Self::emit(&event_tx, turn, event) {
                                // The client detached; keep what was generated as an interrupted reply.
                                state.cancelled = true;
                                stream.cancel();
                                break;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(turn = ?turn, error = %source, "assistant stream emitted an error chunk");
                            state.failure = Some(BackendError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            });
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        let terminal = match state.failure {
            Some(error) => StreamEvent::Error(Self::stream_error_for(&config, &error)),
            None => {
                let messages = if state.reply.is_empty() {
                    Vec::new()
                } else {
                    let mut committed = history.lock().await;
                    committed.push(HistoryMessage::user(request.prompt));
                    committed.push(HistoryMessage::assistant(state.reply));
                    committed.clone()
                };
                StreamEvent::End(StreamEnd {
                    interrupted: state.cancelled,
                    messages,
                })
            }
        };

        // The client may submit again as soon as it sees the terminal event.
        drop(guard);
        Self::emit(&event_tx, turn, terminal);
    }
}

impl TurnBackend for RigBackend {
    fn start_turn(&self, request: TurnRequest) -> BackendResult<TurnHandle> {
        ensure!(
            !request.prompt.trim().is_empty(),
            EmptyPromptSnafu {
                stage: "start-turn",
                turn: request.turn,
            }
        );

        let already_streaming = self.streaming.swap(true, Ordering::AcqRel);
        ensure!(
            !already_streaming,
            TurnInProgressSnafu {
                stage: "start-turn",
                turn: request.turn,
            }
        );
        let guard = StreamingGuard(self.streaming.clone());

        let (event_tx, stream, cancel_rx) = make_event_stream(request.turn);
        let worker: TurnWorker = Box::pin(Self::run_turn_worker(
            self.config.load_full(),
            self.history.clone(),
            request,
            event_tx,
            cancel_rx,
            guard,
        ));

        Ok(TurnHandle { stream, worker })
    }

    fn clear_history<'a>(&'a self) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            self.history.lock().await.clear();
            tracing::info!("cleared backend history");
            Ok(())
        })
    }

    fn reset<'a>(&'a self, config: ProviderConfig) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            self.config.store(Arc::new(config));
            self.history.lock().await.clear();
            tracing::info!("reset backend service configuration");
            Ok(())
        })
    }

    fn history<'a>(&'a self) -> BoxFuture<'a, Vec<HistoryMessage>> {
        Box::pin(async move { self.history.lock().await.clone() })
    }
}

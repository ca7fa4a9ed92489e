//! Backend boundary for assistant turns: the wire events a turn emits, the per-turn event
//! channel, and a rig-core backed service implementation.

mod events;
mod provider;
mod rig_adapter;

pub use events::{
    ErrorDetail, ErrorKind, HistoryMessage, Parameter, Role, StreamEnd, StreamError, StreamEvent,
    ToolActivity, TurnEvent, TurnId,
};
pub use provider::{
    BackendError, BackendResult, BoxFuture, DEFAULT_ENDPOINT, DEFAULT_OPENAI_MODEL,
    ProviderConfig, TurnBackend, TurnEventStream, TurnHandle, TurnRequest, TurnWorker,
    make_event_stream,
};
pub use rig_adapter::RigBackend;

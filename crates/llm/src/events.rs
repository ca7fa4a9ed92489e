use serde::{Deserialize, Serialize};

/// Identifier for one submitted turn.
///
/// A new id is allocated on every submit so events from an abandoned turn can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Speaker role as it appears in the backend history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry of the authoritative conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Required service configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Parameter {
    Endpoint,
    ApiKey,
    ModelName,
}

impl Parameter {
    /// Human readable chip label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Endpoint => "Endpoint",
            Self::ApiKey => "API key",
            Self::ModelName => "Model name",
        }
    }
}

/// Status of a tool invocation reported mid-turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolActivity {
    pub name: String,
    pub state: String,
}

impl ToolActivity {
    pub fn new(name: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: state.into(),
        }
    }
}

/// Terminal payload of a successful or interrupted turn.
///
/// An empty `messages` list means the turn produced no content.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamEnd {
    pub interrupted: bool,
    pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    EmptyParameter,
    RequestSending,
    Serialize,
    /// Any type tag this client does not know about.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetail {
    Parameters(Vec<Parameter>),
    Text(String),
    Other(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub detail: ErrorDetail,
}

impl StreamError {
    pub fn empty_parameter(parameters: Vec<Parameter>) -> Self {
        Self {
            kind: ErrorKind::EmptyParameter,
            detail: ErrorDetail::Parameters(parameters),
        }
    }

    pub fn request_sending(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::RequestSending,
            detail: ErrorDetail::Text(detail.into()),
        }
    }

    pub fn serialize(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Serialize,
            detail: ErrorDetail::Text(detail.into()),
        }
    }
}

/// One unit on a turn's event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "event", content = "data")]
pub enum StreamEvent {
    Push(String),
    /// Reasoning fragment, kept apart from the reply text.
    Reason(String),
    Tool(ToolActivity),
    End(StreamEnd),
    Error(StreamError),
}

impl StreamEvent {
    /// Returns true for events that close the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End(_) | Self::Error(_))
    }
}

/// Stream event routed to the turn that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnEvent {
    pub turn: TurnId,
    pub event: StreamEvent,
}

impl TurnEvent {
    pub fn new(turn: TurnId, event: StreamEvent) -> Self {
        Self { turn, event }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_documented_wire_shapes() {
        let push: StreamEvent =
            serde_json::from_value(json!({ "event": "push", "data": "Hi" })).unwrap();
        assert_eq!(push, StreamEvent::Push("Hi".to_string()));

        let reason: StreamEvent =
            serde_json::from_value(json!({ "event": "reason", "data": "thinking" })).unwrap();
        assert_eq!(reason, StreamEvent::Reason("thinking".to_string()));
        assert!(!reason.is_terminal());

        let tool: StreamEvent = serde_json::from_value(json!({
            "event": "tool",
            "data": { "name": "program_send_message", "state": "running" }
        }))
        .unwrap();
        assert_eq!(
            tool,
            StreamEvent::Tool(ToolActivity::new("program_send_message", "running"))
        );

        let end: StreamEvent = serde_json::from_value(json!({
            "event": "end",
            "data": {
                "interrupted": true,
                "messages": [
                    { "role": "user", "content": "hello" },
                    { "role": "assistant", "content": "Hi" }
                ]
            }
        }))
        .unwrap();
        assert_eq!(
            end,
            StreamEvent::End(StreamEnd {
                interrupted: true,
                messages: vec![HistoryMessage::user("hello"), HistoryMessage::assistant("Hi")],
            })
        );
        assert!(end.is_terminal());
    }

    #[test]
    fn decodes_error_details_by_shape() {
        let missing: StreamEvent = serde_json::from_value(json!({
            "event": "error",
            "data": { "type": "emptyParameter", "detail": ["endpoint", "apiKey", "modelName"] }
        }))
        .unwrap();
        assert_eq!(
            missing,
            StreamEvent::Error(StreamError::empty_parameter(vec![
                Parameter::Endpoint,
                Parameter::ApiKey,
                Parameter::ModelName,
            ]))
        );

        let sending: StreamEvent = serde_json::from_value(json!({
            "event": "error",
            "data": { "type": "requestSending", "detail": "https://api.example.com/v1" }
        }))
        .unwrap();
        assert_eq!(
            sending,
            StreamEvent::Error(StreamError::request_sending("https://api.example.com/v1"))
        );
    }

    #[test]
    fn unknown_error_type_still_decodes() {
        let event: StreamEvent = serde_json::from_value(json!({
            "event": "error",
            "data": { "type": "quotaExceeded", "detail": { "code": 429 } }
        }))
        .unwrap();

        let StreamEvent::Error(error) = event else {
            panic!("expected an error event");
        };
        assert_eq!(error.kind, ErrorKind::Unknown);
        assert_eq!(error.detail, ErrorDetail::Other(json!({ "code": 429 })));
    }
}

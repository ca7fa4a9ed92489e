use std::fmt;

use fold_llm::{ErrorDetail, ErrorKind, Parameter, StreamError};

/// User-facing rendering of a failed turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorAnnotation {
    /// Chip list of configuration fields that must be filled in.
    MissingParameters(Vec<Parameter>),
    /// The outbound request to the model endpoint failed.
    RequestFailed { detail: String },
    /// Anything without a dedicated rendering.
    Failure { detail: String },
    /// Protocol mismatch. Recorded in the log, never shown.
    Silent { detail: String },
}

/// What the user can do about a failed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    FixConfiguration,
    RetryLater,
    None,
}

/// Maps a backend error payload to its annotation.
///
/// Unknown types and payloads whose detail does not fit their type fall back to a generic
/// failure so that no error event goes unrendered.
pub fn classify(error: &StreamError) -> ErrorAnnotation {
    match (error.kind, &error.detail) {
        (ErrorKind::EmptyParameter, ErrorDetail::Parameters(parameters))
            if !parameters.is_empty() =>
        {
            ErrorAnnotation::MissingParameters(parameters.clone())
        }
        (ErrorKind::RequestSending, ErrorDetail::Text(detail)) => ErrorAnnotation::RequestFailed {
            detail: detail.clone(),
        },
        (ErrorKind::Serialize, detail) => ErrorAnnotation::Silent {
            detail: detail_text(detail),
        },
        (_, detail) => ErrorAnnotation::Failure {
            detail: detail_text(detail),
        },
    }
}

const NO_PARAMETERS_DETAIL: &str = "no parameters listed";

fn detail_text(detail: &ErrorDetail) -> String {
    match detail {
        ErrorDetail::Text(text) => text.clone(),
        ErrorDetail::Parameters(parameters) if parameters.is_empty() => {
            NO_PARAMETERS_DETAIL.to_string()
        }
        ErrorDetail::Parameters(parameters) => parameters
            .iter()
            .map(|parameter| parameter.label())
            .collect::<Vec<_>>()
            .join(", "),
        ErrorDetail::Other(value) => value.to_string(),
    }
}

impl ErrorAnnotation {
    pub fn failure(detail: impl Into<String>) -> Self {
        Self::Failure {
            detail: detail.into(),
        }
    }

    /// Returns true when the annotation is attached to the message.
    pub fn is_inline(&self) -> bool {
        !matches!(self, Self::Silent { .. })
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::MissingParameters(_) => "Missing parameters",
            Self::RequestFailed { .. } => "No response from service",
            Self::Failure { .. } => "Something went wrong",
            Self::Silent { .. } => "Malformed response",
        }
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            Self::MissingParameters(_) => Recovery::FixConfiguration,
            Self::RequestFailed { .. } | Self::Failure { .. } => Recovery::RetryLater,
            Self::Silent { .. } => Recovery::None,
        }
    }

    /// Chip labels for the missing-parameter rendering.
    pub fn chips(&self) -> Vec<&'static str> {
        match self {
            Self::MissingParameters(parameters) => parameters
                .iter()
                .map(|parameter| parameter.label())
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for ErrorAnnotation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingParameters(_) => {
                write!(formatter, "{}:", self.title())?;
                for chip in self.chips() {
                    write!(formatter, " [{chip}]")?;
                }
                Ok(())
            }
            Self::RequestFailed { detail } => write!(formatter, "{}: {detail}", self.title()),
            Self::Failure { detail } | Self::Silent { detail } => {
                write!(formatter, "{}: {detail}", self.title())
            }
        }
    }
}

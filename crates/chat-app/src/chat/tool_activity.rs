use std::fmt;

use fold_llm::ToolActivity;

const SEND_MESSAGE_TOOL: &str = "program_send_message";
const SEND_MESSAGE_GLYPH: char = '✉';
const DEFAULT_TOOL_GLYPH: char = '⚙';

/// Renderable tool invocation notice attached beside a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolNotice {
    pub name: String,
    pub state: String,
    pub glyph: char,
}

impl ToolNotice {
    pub fn new(name: impl Into<String>, state: impl Into<String>) -> Self {
        let name = name.into();
        let glyph = glyph_for(&name);
        Self {
            name,
            state: state.into(),
            glyph,
        }
    }

    pub fn label(&self) -> String {
        format!("{} {} · {}", self.glyph, self.name, self.state)
    }
}

impl From<ToolActivity> for ToolNotice {
    fn from(activity: ToolActivity) -> Self {
        Self::new(activity.name, activity.state)
    }
}

impl fmt::Display for ToolNotice {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.label())
    }
}

fn glyph_for(name: &str) -> char {
    match name {
        SEND_MESSAGE_TOOL => SEND_MESSAGE_GLYPH,
        _ => DEFAULT_TOOL_GLYPH,
    }
}

/// Accumulates the tool notices of one turn in arrival order.
#[derive(Debug, Clone, Default)]
pub struct ToolActivityTracker {
    notices: Vec<ToolNotice>,
}

impl ToolActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one activity and returns the notice to attach to the message.
    pub fn record(&mut self, activity: ToolActivity) -> ToolNotice {
        let notice = ToolNotice::from(activity);
        self.notices.push(notice.clone());
        notice
    }

    pub fn notices(&self) -> &[ToolNotice] {
        &self.notices
    }

    pub fn len(&self) -> usize {
        self.notices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notices.is_empty()
    }
}

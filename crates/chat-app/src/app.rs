use std::io::Write;

use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::chat::{
    ChatMessage, ErrorAnnotation, Recovery, Sender, Severity, StoreChange, StoreObserver,
    StreamController, SubmitError, TurnProgress,
};
use crate::settings::{ServiceSettings, SettingsError, SettingsStore};

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Prompt(String),
    Stop,
    Clear,
    Reset,
    /// `/set <key> <value>`: persists one service setting.
    Set { key: String, value: String },
    Quit,
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }

        if let Some(rest) = trimmed.strip_prefix("/set")
            && (rest.is_empty() || rest.starts_with(char::is_whitespace))
        {
            let rest = rest.trim_start();
            let (key, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            return Self::Set {
                key: key.to_string(),
                value: value.trim().to_string(),
            };
        }

        match trimmed {
            "/stop" => Self::Stop,
            "/clear" => Self::Clear,
            "/reset" => Self::Reset,
            "/quit" | "/exit" => Self::Quit,
            other if other.starts_with('/') && !other.starts_with("//") => {
                Self::Unknown(other.to_string())
            }
            // A doubled slash sends the rest of the line verbatim.
            other => Self::Prompt(other.strip_prefix('/').unwrap_or(other).to_string()),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

/// How far a message has already been printed.
#[derive(Debug, Clone, Copy, Default)]
struct RenderCursor {
    reasoning_len: usize,
    text_len: usize,
    tool_notices: usize,
    status_note: bool,
    error: bool,
}

/// Store observer that prints assistant output as it streams in.
pub struct TerminalRenderer<W> {
    out: W,
    cursors: Vec<RenderCursor>,
    mid_line: bool,
    thinking: bool,
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            cursors: Vec::new(),
            mid_line: false,
            thinking: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Err(error) = self.out.write_all(text.as_bytes()).and_then(|()| self.out.flush()) {
            tracing::warn!(error = %error, "failed to write to terminal");
            return;
        }
        self.mid_line = !text.ends_with('\n');
    }

    fn write_line(&mut self, line: &str) {
        self.end_line();
        self.thinking = false;
        self.write(&format!("{line}\n"));
    }

    fn end_line(&mut self) {
        if self.mid_line {
            self.write("\n");
        }
    }

    fn render(&mut self, index: usize, messages: &[ChatMessage]) {
        let Some(message) = messages.get(index) else {
            return;
        };
        if self.cursors.len() <= index {
            self.cursors.resize(index + 1, RenderCursor::default());
        }
        let mut cursor = self.cursors[index];
        let content = message.content();

        // Reasoning prints on its own `think>` lines; the reply resumes on a fresh line.
        if let Some(delta) = content.reasoning.get(cursor.reasoning_len..)
            && !delta.is_empty()
        {
            if !self.thinking {
                self.end_line();
                self.write("think> ");
                self.thinking = true;
            }
            self.write(delta);
            cursor.reasoning_len = content.reasoning.len();
        }

        if let Some(delta) = content.text.get(cursor.text_len..)
            && !delta.is_empty()
        {
            if self.thinking {
                self.end_line();
                self.thinking = false;
            }
            self.write(delta);
            cursor.text_len = content.text.len();
        }

        for notice in content.tool_notices.iter().skip(cursor.tool_notices) {
            self.write_line(&format!("  {notice}"));
        }
        cursor.tool_notices = content.tool_notices.len();

        if !cursor.status_note
            && let Some(note) = &content.status_note
        {
            let marker = match note.severity {
                Severity::Error => "!",
                Severity::Warn => "?",
                Severity::Info | Severity::Nothing => "·",
            };
            self.write_line(&format!("  {marker} {}", note.label));
            cursor.status_note = true;
        }

        if !cursor.error
            && let Some(annotation) = &content.error
        {
            self.write_line(&render_annotation(annotation));
            cursor.error = true;
        }

        self.cursors[index] = cursor;
    }
}

fn render_annotation(annotation: &ErrorAnnotation) -> String {
    let hint = match annotation.recovery() {
        Recovery::FixConfiguration => " (update the service settings, then /reset)",
        Recovery::RetryLater => " (try again)",
        Recovery::None => "",
    };
    format!("  ! {annotation}{hint}")
}

impl<W: Write> StoreObserver for TerminalRenderer<W> {
    fn after_change(&mut self, change: &StoreChange, messages: &[ChatMessage]) {
        match *change {
            StoreChange::Appended { index, sender, .. } => {
                if self.cursors.len() <= index {
                    self.cursors.resize(index + 1, RenderCursor::default());
                }
                match sender {
                    // Already on screen as typed input.
                    Sender::User => {
                        let text_len = messages.get(index).map_or(0, |m| m.text().len());
                        self.cursors[index].text_len = text_len;
                    }
                    Sender::Assistant => {
                        self.write_line("assistant>");
                        self.render(index, messages);
                    }
                    Sender::System => {
                        let text = messages.get(index).map_or("", ChatMessage::text);
                        self.write_line(&format!("[{text}]"));
                        if let Some(cursor) = self.cursors.get_mut(index) {
                            cursor.text_len = text.len();
                        }
                    }
                }
            }
            StoreChange::Mutated { index, .. } => self.render(index, messages),
            StoreChange::Closed { index } => {
                self.render(index, messages);
                self.end_line();
                self.thinking = false;
            }
            StoreChange::Cleared => {
                self.cursors.clear();
                self.write_line("-- conversation cleared --");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Line-oriented chat loop over a controller.
pub struct ChatShell {
    controller: StreamController,
    settings: SettingsStore,
}

impl ChatShell {
    pub fn new(controller: StreamController, settings: SettingsStore) -> Self {
        Self {
            controller,
            settings,
        }
    }

    pub fn controller(&self) -> &StreamController {
        &self.controller
    }

    /// Runs until `/quit` or end of input. Input stays live while a turn streams, so
    /// `/stop` and `/clear` can interrupt it.
    pub async fn run<R, N>(&mut self, input: R, mut notices: N) -> Result<(), AppError>
    where
        R: AsyncBufRead + Unpin,
        N: Write,
    {
        let mut lines = input.lines();
        loop {
            let streaming = self.controller.active_turn().is_some();
            tokio::select! {
                progress = self.controller.pump(), if streaming => {
                    if let Some(TurnProgress::Closed(outcome)) = progress {
                        tracing::debug!(outcome = ?outcome, "turn finished");
                    }
                }
                line = lines.next_line() => {
                    let line = line.context(ReadInputSnafu { stage: "read-line" })?;
                    let Some(line) = line else {
                        // Piped input ends before the reply does.
                        self.controller.run_turn().await;
                        break;
                    };
                    if self.handle(Command::parse(&line), &mut notices).await? == Flow::Quit {
                        self.controller.detach();
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle<N: Write>(&mut self, command: Command, notices: &mut N) -> Result<Flow, AppError> {
        match command {
            Command::Prompt(text) => match self.controller.submit(&text) {
                Ok(turn) => tracing::debug!(turn = ?turn, "submitted prompt"),
                Err(SubmitError::TurnInProgress { .. }) => {
                    notice(notices, "a response is already in progress, /stop to interrupt it")?;
                }
                Err(error) => notice(notices, &error.to_string())?,
            },
            Command::Stop => {
                if !self.controller.stop() {
                    notice(notices, "nothing to stop")?;
                }
            }
            Command::Clear => {
                if let Err(error) = self.controller.clear_conversation().await {
                    tracing::error!(error = %error, "failed to clear conversation");
                    notice(notices, &error.to_string())?;
                }
            }
            Command::Reset => {
                let settings = self.settings.reload();
                self.controller.set_turn_timeout(settings.turn_timeout());
                if let Err(error) = self
                    .controller
                    .reset_service(settings.to_provider_config())
                    .await
                {
                    tracing::error!(error = %error, "failed to reset service");
                    notice(notices, &error.to_string())?;
                }
            }
            Command::Set { key, value } => match self.apply_setting(&key, &value) {
                Ok(()) => notice(notices, &format!("saved {key}, /reset to apply it"))?,
                Err(error) => {
                    tracing::warn!(key = %key, error = %error, "failed to apply setting");
                    notice(notices, &error.to_string())?;
                }
            },
            Command::Quit => return Ok(Flow::Quit),
            Command::Empty => {}
            Command::Unknown(command) => {
                notice(
                    notices,
                    &format!("unknown command {command}, try /stop /clear /reset /set /quit"),
                )?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Persists one setting. The turn timeout applies at once; the service fields wait
    /// for `/reset`.
    fn apply_setting(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut settings = ServiceSettings::clone(&self.settings.settings());
        settings.set(key, value)?;
        self.settings.update(settings)?;
        self.controller
            .set_turn_timeout(self.settings.settings().turn_timeout());
        Ok(())
    }
}

fn notice<N: Write>(notices: &mut N, text: &str) -> Result<(), AppError> {
    writeln!(notices, "{text}").context(WriteOutputSnafu {
        stage: "write-notice",
    })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use std::sync::Arc;

    use fold_llm::{Parameter, ProviderConfig, RigBackend, ToolActivity};

    use super::*;
    use crate::chat::{ChangeKind, MessageStore, StatusNote, ToolNotice};
    use crate::settings::state::SETTINGS_FILE_NAME;

    #[test]
    fn parses_commands_and_prompts() {
        assert_eq!(Command::parse("  "), Command::Empty);
        assert_eq!(Command::parse("/stop"), Command::Stop);
        assert_eq!(Command::parse(" /clear\n"), Command::Clear);
        assert_eq!(Command::parse("/reset"), Command::Reset);
        assert_eq!(Command::parse("/exit"), Command::Quit);
        assert_eq!(
            Command::parse("/set model_name  gpt-4.1 "),
            Command::Set {
                key: "model_name".to_string(),
                value: "gpt-4.1".to_string()
            }
        );
        assert_eq!(
            Command::parse("/set api_key"),
            Command::Set {
                key: "api_key".to_string(),
                value: String::new()
            }
        );
        assert_eq!(
            Command::parse("/settings"),
            Command::Unknown("/settings".to_string())
        );
        assert_eq!(
            Command::parse("/help"),
            Command::Unknown("/help".to_string())
        );
        assert_eq!(
            Command::parse("hello there"),
            Command::Prompt("hello there".to_string())
        );
        assert_eq!(
            Command::parse("//stop is a command"),
            Command::Prompt("/stop is a command".to_string())
        );
    }

    fn rendered(renderer: &Rc<RefCell<TerminalRenderer<Vec<u8>>>>) -> String {
        String::from_utf8(renderer.borrow().out.clone()).unwrap()
    }

    #[test]
    fn renderer_prints_deltas_and_annotations() {
        let renderer = Rc::new(RefCell::new(TerminalRenderer::new(Vec::new())));
        let mut store = MessageStore::new();
        store.subscribe(renderer.clone());

        store.append(ChatMessage::user("hello"));
        let index = store.append(ChatMessage::new(Sender::Assistant, "Hi"));
        store
            .mutate(index, ChangeKind::Text, |content| content.text.push_str(" there"))
            .unwrap();
        store
            .mutate(index, ChangeKind::Annotation, |content| {
                content
                    .tool_notices
                    .push(ToolNotice::from(ToolActivity::new("search", "done")));
                content.status_note = Some(StatusNote::interrupted());
            })
            .unwrap();
        store.close(index).unwrap();

        assert_eq!(
            rendered(&renderer),
            "assistant>\nHi there\n  ⚙ search · done\n  · Interrupted\n"
        );
    }

    #[test]
    fn renderer_prints_error_with_recovery_hint() {
        let renderer = Rc::new(RefCell::new(TerminalRenderer::new(Vec::new())));
        let mut store = MessageStore::new();
        store.subscribe(renderer.clone());

        let mut message = ChatMessage::assistant();
        message.content_mut().error = Some(ErrorAnnotation::MissingParameters(vec![
            Parameter::Endpoint,
        ]));
        let index = store.append(message);
        store.close(index).unwrap();
        store.clear();

        assert_eq!(
            rendered(&renderer),
            "assistant>\n  ! Missing parameters: [Endpoint] (update the service settings, then /reset)\n-- conversation cleared --\n"
        );
    }

    #[test]
    fn renderer_sets_reasoning_apart_from_reply() {
        let renderer = Rc::new(RefCell::new(TerminalRenderer::new(Vec::new())));
        let mut store = MessageStore::new();
        store.subscribe(renderer.clone());

        let mut message = ChatMessage::assistant();
        message.content_mut().reasoning.push_str("Let me");
        let index = store.append(message);
        let steps: [(bool, &str); 4] = [
            (true, " think"),
            (false, "Answer"),
            (true, "Wait"),
            (false, "!"),
        ];
        for (reasoning, delta) in steps {
            store
                .mutate(index, ChangeKind::Text, |content| {
                    if reasoning {
                        content.reasoning.push_str(delta);
                    } else {
                        content.text.push_str(delta);
                    }
                })
                .unwrap();
        }
        store.close(index).unwrap();

        assert_eq!(
            rendered(&renderer),
            "assistant>\nthink> Let me think\nAnswer\nthink> Wait\n!\n"
        );
    }

    #[tokio::test]
    async fn set_command_persists_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        let backend = Arc::new(RigBackend::new(ProviderConfig::default()));
        let mut shell = ChatShell::new(
            StreamController::new(backend),
            SettingsStore::new(path.clone()),
        );

        let input = "/set model_name gpt-4.1\n/set turn_timeout_secs 0\n/set colour blue\n";
        let mut notices = Vec::new();
        shell.run(input.as_bytes(), &mut notices).await.unwrap();

        let notices = String::from_utf8(notices).unwrap();
        assert!(notices.contains("saved model_name"));
        assert!(notices.contains("unknown setting `colour`"));
        assert_eq!(shell.controller().turn_timeout(), None);

        let reopened = SettingsStore::new(path).settings();
        assert_eq!(reopened.model_name, "gpt-4.1");
        assert_eq!(reopened.turn_timeout_secs, 0);
    }
}

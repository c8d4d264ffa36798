//! Per-connection session: history, virtual state, and turn sequencing.
//!
//! A [`Session`] is created when a connection is accepted and dropped when
//! it closes.  It is driven by operator lines ([`Session::submit`]) and
//! runs at most one model turn at a time ([`Session::run_turn`]).

pub mod history;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::context::wrap_with_snapshot;
use crate::decoder::{DecodeMode, TurnDecoder, TurnOutcome};
use crate::models::{ChatMessage, ModelProvider, ToolChoice, TurnRequest};
use crate::render::ansi::CLEAR_SCREEN;
use crate::terminal::{InputEvent, Outbound};
use crate::tools::{list_tools, terminal_output_tool, ToolMeta, TERMINAL_OUTPUT};
use crate::vfs::SessionState;

pub use history::ConversationHistory;

// ── Settings ─────────────────────────────────────────────────

/// Process-wide session behaviour, shared by every connection.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub mode: DecodeMode,
    pub stateful: bool,
    pub history_window: usize,
    pub greeting: String,
    pub prompt: String,
    pub farewell: String,
    pub leave_commands: Vec<String>,
    pub system_prompt: String,
    pub max_tokens: u32,
}

impl SessionSettings {
    pub fn from_config(cfg: &Config, system_prompt: String) -> Self {
        Self {
            mode: cfg.session.decode_mode(),
            stateful: cfg.session.stateful,
            history_window: cfg.session.history_window,
            greeting: cfg.session.greeting.clone(),
            prompt: cfg.session.prompt.clone(),
            farewell: cfg.session.farewell.clone(),
            leave_commands: cfg.session.leave_commands.clone(),
            system_prompt,
            max_tokens: cfg.model.max_tokens,
        }
    }

    /// Calls offered to the model and how it must use them.
    pub fn directive(&self) -> (Vec<ToolMeta>, ToolChoice) {
        match &self.mode {
            DecodeMode::Text => (Vec::new(), ToolChoice::None),
            DecodeMode::SingleField { field } => (
                vec![terminal_output_tool(field)],
                ToolChoice::Tool(TERMINAL_OUTPUT.into()),
            ),
            DecodeMode::MultiCall => (list_tools().to_vec(), ToolChoice::Any),
        }
    }

    /// Whether the bridge prints the prompt (the model does in text mode).
    pub fn structured(&self) -> bool {
        self.mode != DecodeMode::Text
    }
}

// ── Session ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingModel,
}

/// What to do with a submitted line.
#[derive(Debug)]
pub enum LineAction {
    /// Dropped: a turn is already in flight.
    Ignored,
    /// Answered without the model; write this text.
    Local(String),
    /// The operator is leaving.
    Leave,
    /// Send this request to the model.
    Dispatch(TurnRequest),
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEnd {
    Completed,
    /// The operator sent end-of-transmission mid-turn.
    Leave,
    /// The connection or server is going away.
    Disconnected,
}

#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    settings: Arc<SessionSettings>,
    history: ConversationHistory,
    state: SessionState,
    phase: Phase,
}

impl Session {
    pub fn new(settings: Arc<SessionSettings>) -> Self {
        Self {
            id: Uuid::new_v4(),
            history: ConversationHistory::new(settings.history_window),
            state: SessionState::new(),
            phase: Phase::Idle,
            settings,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// The prompt for the current directory.
    pub fn prompt(&self) -> String {
        self.settings
            .prompt
            .replace("{cwd}", self.state.current_directory())
    }

    pub fn farewell(&self) -> String {
        if self.settings.farewell.is_empty() {
            String::new()
        } else {
            format!("{}\n", self.settings.farewell)
        }
    }

    /// The boot turn, if a greeting is configured.
    pub fn greeting(&mut self) -> Option<TurnRequest> {
        if self.settings.greeting.is_empty() {
            return None;
        }
        let greeting = self.settings.greeting.clone();
        Some(self.dispatch(&greeting))
    }

    /// Route one operator line.
    pub fn submit(&mut self, line: &str) -> LineAction {
        if self.phase == Phase::AwaitingModel {
            debug!(session = %self.id, "line dropped while a turn is in flight");
            return LineAction::Ignored;
        }
        let line = line.trim();
        if line.is_empty() {
            return LineAction::Local(self.prompt());
        }
        if self.settings.leave_commands.iter().any(|c| c == line) {
            return LineAction::Leave;
        }
        if let Some(out) = self.local_command(line) {
            return LineAction::Local(out);
        }
        LineAction::Dispatch(self.dispatch(line))
    }

    /// Commands answered from the state store alone.
    fn local_command(&mut self, line: &str) -> Option<String> {
        let mut words = line.split_whitespace();
        let cmd = words.next()?;
        let arg = words.next();
        if words.next().is_some() {
            return None;
        }
        match (cmd, arg) {
            ("clear", None) => Some(format!("{CLEAR_SCREEN}{}", self.prompt())),
            ("pwd", None) if self.settings.stateful => Some(format!(
                "{}\n{}",
                self.state.current_directory(),
                self.prompt()
            )),
            ("cd", target) if self.settings.stateful && target != Some("-") => {
                self.state.set_current_directory(target.unwrap_or("~"));
                debug!(session = %self.id, cwd = %self.state.current_directory(), "local cd");
                Some(self.prompt())
            }
            _ => None,
        }
    }

    /// Record the operator turn and build the request for it.
    pub fn dispatch(&mut self, line: &str) -> TurnRequest {
        let content = if self.settings.stateful {
            wrap_with_snapshot(&self.state.serialize(), line)
        } else {
            line.to_string()
        };
        self.history.push(ChatMessage::user(content));
        self.phase = Phase::AwaitingModel;
        self.request()
    }

    fn request(&self) -> TurnRequest {
        let (tools, tool_choice) = self.settings.directive();
        TurnRequest {
            system: self.settings.system_prompt.clone(),
            messages: self.history.iter().cloned().collect(),
            tools,
            tool_choice,
            max_tokens: self.settings.max_tokens,
        }
    }

    /// Record the model's side of a finished turn and return to idle.
    pub fn complete(&mut self, outcome: TurnOutcome) {
        if let Some(reply) = outcome.assistant {
            self.history.push(reply);
        }
        if let Some(ack) = outcome.acknowledgement {
            self.history.push(ack);
        }
        self.phase = Phase::Idle;
    }

    /// Stream one turn from `provider` to `out`.
    ///
    /// Operator lines arriving meanwhile are dropped.  Service failures are
    /// shown as one `[ERROR]` line and leave the session usable; only
    /// transport failures are returned as `Err`.
    pub async fn run_turn(
        &mut self,
        provider: &dyn ModelProvider,
        request: TurnRequest,
        out: &mut Outbound,
        input: &mut mpsc::Receiver<InputEvent>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<TurnEnd> {
        let started = Instant::now();
        let mut decoder = TurnDecoder::new(self.settings.mode.clone());
        let mut stream = provider.stream_turn(&request);
        let mut failure = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(TurnEnd::Disconnected),
                event = input.recv() => match event {
                    Some(InputEvent::Line(line)) => {
                        self.submit(&line);
                    }
                    Some(InputEvent::Interrupt) => {}
                    Some(InputEvent::Eof) => return Ok(TurnEnd::Leave),
                    None => return Ok(TurnEnd::Disconnected),
                },
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        let text = decoder.feed(event, &mut self.state);
                        out.text(&text).await?;
                    }
                    Some(Err(err)) => {
                        failure = Some(err);
                        break;
                    }
                    None => break,
                },
            }
        }
        drop(stream);

        let mid_line = decoder.mid_line();
        let outcome = decoder.finish();
        info!(
            session = %self.id,
            applied = outcome.applied.len(),
            discarded = outcome.discarded,
            nodes = self.state.node_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn complete"
        );
        self.complete(outcome);

        let mut tail = String::new();
        if mid_line && (failure.is_some() || self.settings.structured()) {
            tail.push('\n');
        }
        if let Some(err) = failure {
            warn!(session = %self.id, error = %format!("{err:#}"), "model service failure");
            tail.push_str(&format!("[ERROR] {err:#}\n"));
            tail.push_str(&self.prompt());
        } else if self.settings.structured() {
            tail.push_str(&self.prompt());
        }
        out.text(&tail).await?;
        out.flush().await?;
        Ok(TurnEnd::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(mode: DecodeMode, stateful: bool) -> Arc<SessionSettings> {
        Arc::new(SessionSettings {
            mode,
            stateful,
            history_window: 4,
            greeting: "[operator connected]".into(),
            prompt: "{cwd} > ".into(),
            farewell: "bye".into(),
            leave_commands: vec!["exit".into()],
            system_prompt: "sys".into(),
            max_tokens: 64,
        })
    }

    #[test]
    fn local_cd_and_pwd_skip_history() {
        let mut s = Session::new(settings(DecodeMode::MultiCall, true));
        let LineAction::Local(out) = s.submit("cd /var/log") else {
            panic!("expected local");
        };
        assert_eq!(out, "/var/log > ");
        let LineAction::Local(out) = s.submit("pwd") else {
            panic!("expected local");
        };
        assert_eq!(out, "/var/log\n/var/log > ");
        assert!(s.history().is_empty());
    }

    #[test]
    fn cd_goes_to_model_when_stateless() {
        let mut s = Session::new(settings(DecodeMode::MultiCall, false));
        assert!(matches!(s.submit("cd /tmp"), LineAction::Dispatch(_)));
    }

    #[test]
    fn second_line_during_turn_is_ignored() {
        let mut s = Session::new(settings(DecodeMode::MultiCall, true));
        assert!(matches!(s.submit("ls"), LineAction::Dispatch(_)));
        let before = s.state().serialize();
        assert!(matches!(s.submit("cd /etc"), LineAction::Ignored));
        assert_eq!(s.state().serialize(), before);
        assert_eq!(s.history().len(), 1);
    }

    #[test]
    fn stateful_dispatch_carries_snapshot() {
        let mut s = Session::new(settings(DecodeMode::MultiCall, true));
        let LineAction::Dispatch(req) = s.submit("ls") else {
            panic!("expected dispatch");
        };
        let text = req.messages[0].text();
        assert!(text.starts_with("<session_state>\ncwd: /"));
        assert!(text.ends_with("\n\nls"));
        assert_eq!(req.tool_choice, ToolChoice::Any);
        assert_eq!(s.phase(), Phase::AwaitingModel);
    }

    #[test]
    fn single_field_forces_terminal_output() {
        let mut s = Session::new(settings(
            DecodeMode::SingleField {
                field: "output".into(),
            },
            false,
        ));
        let req = s.greeting().unwrap();
        assert_eq!(req.tool_choice, ToolChoice::Tool("terminal_output".into()));
        assert_eq!(req.tools.len(), 1);
        assert_eq!(req.messages[0].text(), "[operator connected]");
    }

    #[test]
    fn leave_empty_and_clear() {
        let mut s = Session::new(settings(DecodeMode::Text, false));
        assert!(matches!(s.submit("exit"), LineAction::Leave));
        assert!(matches!(s.submit("   "), LineAction::Local(ref p) if p == "/ > "));
        assert!(matches!(s.submit("clear"), LineAction::Local(ref p) if p.starts_with(CLEAR_SCREEN)));
        assert_eq!(s.farewell(), "bye\n");
    }
}

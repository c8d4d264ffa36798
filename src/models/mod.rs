//! Model service abstractions.
//!
//! Defines the [`ModelProvider`] trait, the block-structured
//! [`StreamEvent`] every provider yields, the [`ChatMessage`] history
//! representation, and concrete implementations
//! ([`AnthropicProvider`], [`OpenAICompatProvider`], [`StubProvider`]).

pub mod anthropic;
pub mod openai_compat;

use std::any::Any;
use std::pin::Pin;

use futures_core::Stream;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::{ModelConfig, ProviderKind};
use crate::tools::ToolMeta;

pub use anthropic::AnthropicProvider;
pub use openai_compat::OpenAICompatProvider;

// ---------------------------------------------------------------------------
// ChatMessage – shared history representation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One piece of a message's content.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

/// A single turn in the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    /// Operator-side plain text turn.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text(text.into())],
        }
    }

    /// Model-side plain text turn.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text(text.into())],
        }
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    fn has_tool_result(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }
}

/// Reshape stored history into a sequence every service accepts.
///
/// Leading turns that cannot open a conversation (model turns, or
/// acknowledgements whose calls fell out of the window) are skipped, empty
/// turns are dropped, and consecutive same-role turns are merged.
pub fn wire_messages<'a, I>(history: I) -> Vec<ChatMessage>
where
    I: IntoIterator<Item = &'a ChatMessage>,
{
    let mut out: Vec<ChatMessage> = Vec::new();
    for msg in history {
        if msg.content.is_empty() {
            continue;
        }
        if out.is_empty() && (msg.role != Role::User || msg.has_tool_result()) {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.role == msg.role => last.content.extend(msg.content.iter().cloned()),
            _ => out.push(msg.clone()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Turn request
// ---------------------------------------------------------------------------

/// How the service is told to use the registered calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    /// Free text, no calls offered.
    None,
    /// At least one call, any of the offered ones.
    Any,
    /// Exactly the named call.
    Tool(String),
}

/// Everything a provider needs for one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolMeta>,
    pub tool_choice: ToolChoice,
    pub max_tokens: u32,
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Text,
    ToolUse { id: String, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockDelta {
    Text(String),
    InputJson(String),
}

/// A single event of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    BlockStart { index: usize, block: BlockKind },
    BlockDelta { index: usize, delta: BlockDelta },
    BlockStop { index: usize },
}

pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Result<StreamEvent, anyhow::Error>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// ModelProvider trait
// ---------------------------------------------------------------------------

/// Trait implemented by every model backend.
pub trait ModelProvider: Send + Sync {
    /// Issue one turn and return its event stream.  Request failures are
    /// yielded as the stream's first `Err`.
    fn stream_turn<'a>(&'a self, request: &'a TurnRequest) -> EventStream<'a>;

    /// Downcast helper for tests and diagnostics.
    fn as_any(&self) -> &dyn Any;
}

/// Split `text` into fragments of at most `size` characters.
pub(crate) fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// Incremental `text/event-stream` splitter yielding `data:` payloads.
///
/// Bytes are buffered until a full line arrives so multi-byte characters
/// split across network chunks decode intact.
#[derive(Debug, Default)]
pub(crate) struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end();
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

// ---------------------------------------------------------------------------
// StubProvider – offline echo
// ---------------------------------------------------------------------------

/// Provider that echoes the operator's last line through whichever call
/// the request asks for.  Used when no credentials are configured.
pub struct StubProvider;

impl StubProvider {
    fn last_line(request: &TurnRequest) -> String {
        request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .and_then(|t| t.lines().last().map(str::to_string))
            .unwrap_or_default()
    }

    fn events(request: &TurnRequest) -> Vec<StreamEvent> {
        let echo = format!("[stub] {}", Self::last_line(request));
        let (block, body) = match &request.tool_choice {
            ToolChoice::None => (BlockKind::Text, format!("{echo}\n$ ")),
            ToolChoice::Tool(name) => {
                let field = request
                    .tools
                    .iter()
                    .find(|t| &t.name == name)
                    .and_then(|t| t.args_schema["required"][0].as_str())
                    .unwrap_or("output")
                    .to_string();
                let block = BlockKind::ToolUse {
                    id: "stub_0".into(),
                    name: name.clone(),
                };
                (block, json!({ field: format!("{echo}\n") }).to_string())
            }
            ToolChoice::Any => {
                let block = BlockKind::ToolUse {
                    id: "stub_0".into(),
                    name: "command_output".into(),
                };
                (block, json!({ "lines": [echo] }).to_string())
            }
        };
        let text_mode = block == BlockKind::Text;
        let mut events = vec![StreamEvent::BlockStart { index: 0, block }];
        for fragment in chunk_text(&body, 8) {
            let delta = if text_mode {
                BlockDelta::Text(fragment)
            } else {
                BlockDelta::InputJson(fragment)
            };
            events.push(StreamEvent::BlockDelta { index: 0, delta });
        }
        events.push(StreamEvent::BlockStop { index: 0 });
        events
    }
}

impl ModelProvider for StubProvider {
    fn stream_turn<'a>(&'a self, request: &'a TurnRequest) -> EventStream<'a> {
        Box::pin(async_stream::try_stream! {
            for event in Self::events(request) {
                yield event;
            }
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Provider factory
// ---------------------------------------------------------------------------

/// Build the configured provider.
///
/// Hosted providers without a resolvable key degrade to [`StubProvider`]
/// with a warning so the server still starts for local testing.
pub fn build_provider(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    let key = resolve_config_key(cfg.api_key.as_deref(), cfg.provider.as_str());
    match cfg.provider {
        ProviderKind::Stub => Ok(Box::new(StubProvider)),
        ProviderKind::Anthropic => {
            if key.is_empty() {
                warn!("anthropic provider has no api key, using stub replies");
                return Ok(Box::new(StubProvider));
            }
            let endpoint = cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| anthropic::DEFAULT_ENDPOINT.to_string());
            Ok(Box::new(AnthropicProvider::new(endpoint, key, cfg.model.clone())?))
        }
        ProviderKind::OpenAICompat => {
            // Checked by Config::validate; repeated for callers that skip it.
            let Some(endpoint) = cfg.endpoint.clone() else {
                anyhow::bail!("openai-compat provider requires model.endpoint");
            };
            Ok(Box::new(OpenAICompatProvider::new(endpoint, key, cfg.model.clone())?))
        }
    }
}

/// Resolve an API key: config value → env var → empty string.
///
/// If the config value starts with `$`, it's treated as an env-var reference.
pub fn resolve_config_key(config_key: Option<&str>, provider_id: &str) -> String {
    if let Some(k) = config_key {
        if let Some(var) = k.strip_prefix('$') {
            return std::env::var(var).unwrap_or_default();
        }
        if !k.is_empty() {
            return k.to_string();
        }
    }
    let env_name = format!("{}_API_KEY", provider_id.to_uppercase().replace('-', "_"));
    std::env::var(env_name).unwrap_or_default()
}

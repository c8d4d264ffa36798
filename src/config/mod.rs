use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::decoder::DecodeMode;

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address the terminal server binds.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Model service settings.
    #[serde(default)]
    pub model: ModelConfig,
    /// Per-connection session behaviour.
    #[serde(default)]
    pub session: SessionConfig,
    /// System prompt source.
    #[serde(default)]
    pub persona: PersonaConfig,
    /// Telnet negotiation.
    #[serde(default)]
    pub telnet: TelnetConfig,
}

fn default_listen() -> String {
    "0.0.0.0:2222".into()
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            model: ModelConfig::default(),
            session: SessionConfig::default(),
            persona: PersonaConfig::default(),
            telnet: TelnetConfig::default(),
        }
    }
}

/// Which model service backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai-compat", alias = "openai_compat", alias = "compat")]
    OpenAICompat,
    #[serde(rename = "stub")]
    Stub,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAICompat => "openai-compat",
            ProviderKind::Stub => "stub",
        }
    }
}

/// The configured model service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    /// Model name to request.
    #[serde(default = "default_model")]
    pub model: String,
    /// API key (plain text or env-var reference like `$ANTHROPIC_API_KEY`).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Endpoint URL; required for `openai-compat`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            model: default_model(),
            api_key: None,
            endpoint: None,
            max_tokens: default_max_tokens(),
        }
    }
}

/// How model replies are turned into output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Text,
    SingleField,
    #[default]
    MultiCall,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default)]
    pub mode: ModeKind,
    /// Prefix every operator line with a snapshot of the session state.
    #[serde(default = "default_true")]
    pub stateful: bool,
    /// Turns kept in the conversation history.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Synthetic first operator line; empty disables the boot turn.
    #[serde(default = "default_greeting")]
    pub greeting: String,
    /// Prompt template; `{cwd}` is replaced by the current directory.
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// Line written before the connection closes.
    #[serde(default = "default_farewell")]
    pub farewell: String,
    #[serde(default = "default_leave_commands")]
    pub leave_commands: Vec<String>,
    /// Field name of the single-field call.
    #[serde(default = "default_output_field")]
    pub output_field: String,
}

fn default_history_window() -> usize {
    80
}

fn default_greeting() -> String {
    "[operator connected]".into()
}

fn default_prompt() -> String {
    "{cwd} > ".into()
}

fn default_farewell() -> String {
    "Connection closed.".into()
}

fn default_leave_commands() -> Vec<String> {
    vec!["exit".into(), "logout".into(), "quit".into()]
}

fn default_output_field() -> String {
    "output".into()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: ModeKind::default(),
            stateful: true,
            history_window: default_history_window(),
            greeting: default_greeting(),
            prompt: default_prompt(),
            farewell: default_farewell(),
            leave_commands: default_leave_commands(),
            output_field: default_output_field(),
        }
    }
}

impl SessionConfig {
    pub fn decode_mode(&self) -> DecodeMode {
        match self.mode {
            ModeKind::Text => DecodeMode::Text,
            ModeKind::SingleField => DecodeMode::SingleField {
                field: self.output_field.clone(),
            },
            ModeKind::MultiCall => DecodeMode::MultiCall,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PersonaConfig {
    /// Inline system prompt text.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// File holding the system prompt; relative paths resolve against
    /// the config file's directory.
    #[serde(default)]
    pub system_prompt_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TelnetConfig {
    /// Offer WILL ECHO / WILL SGA on connect.
    #[serde(default = "default_true")]
    pub negotiate: bool,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self { negotiate: true }
    }
}

impl Config {
    /// Read and parse a YAML configuration file.
    ///
    /// Relative `persona.system_prompt_file` paths are rewritten against
    /// the config file's directory.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&contents)?;

        if let Some(file) = config.persona.system_prompt_file.as_mut() {
            let p = Path::new(file.as_str());
            if p.is_relative() {
                if let Some(dir) = path.parent() {
                    *file = dir.join(p).to_string_lossy().to_string();
                }
            }
        }

        tracing::debug!(
            path = %path.display(),
            provider = config.model.provider.as_str(),
            mode = ?config.session.mode,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Load `path` if given, else the default location, falling back to
    /// built-in defaults when the default file does not exist.
    pub async fn resolve(path: Option<&Path>) -> anyhow::Result<Config> {
        if let Some(path) = path {
            return Self::load(path).await;
        }
        let default_path = default_config_path();
        if tokio::fs::try_exists(&default_path).await.unwrap_or(false) {
            Self::load(&default_path).await
        } else {
            tracing::warn!(
                path = %default_path.display(),
                "config file not found, using built-in defaults"
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse and validate YAML text.
    pub fn parse(contents: &str) -> anyhow::Result<Config> {
        // An empty document deserializes as unit, not as an empty map.
        let config: Config = if contents.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml_ng::from_str(contents).context("failed to parse config YAML")?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate semantic constraints that serde cannot enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen
            .parse::<SocketAddr>()
            .with_context(|| format!("config: listen address '{}' is invalid", self.listen))?;

        if self.session.history_window == 0 {
            anyhow::bail!("config: session.history_window must be at least 1");
        }
        if self.model.max_tokens == 0 {
            anyhow::bail!("config: model.max_tokens must be at least 1");
        }
        if self.model.model.trim().is_empty() && self.model.provider != ProviderKind::Stub {
            anyhow::bail!("config: model.model is empty");
        }
        if self.model.provider == ProviderKind::OpenAICompat
            && self.model.endpoint.as_deref().map_or(true, |e| e.trim().is_empty())
        {
            anyhow::bail!("config: openai-compat provider requires model.endpoint");
        }
        if self.session.mode == ModeKind::SingleField && self.session.output_field.trim().is_empty()
        {
            anyhow::bail!("config: session.output_field must not be empty in single_field mode");
        }
        if self.persona.system_prompt.is_some() && self.persona.system_prompt_file.is_some() {
            anyhow::bail!("config: set only one of persona.system_prompt and persona.system_prompt_file");
        }
        Ok(())
    }
}

/// `<mirage home>/config.yaml`.
pub fn default_config_path() -> PathBuf {
    crate::mirage_home().join("config.yaml")
}

//! Structured-call registry.
//!
//! The model never writes free text in the structured modes: it fills in
//! one of the schemas registered here and the [`crate::render`] layer turns
//! the result into terminal bytes.  This module owns the *shapes* only:
//!
//! * [`ToolMeta`]: name, description and JSON Schema sent to the service.
//! * [`CallKind`]: the closed set of call names.
//! * [`ToolCall`]: the typed, validated form of a call's arguments,
//!   produced by [`ToolCall::decode`].  Nothing downstream touches raw JSON.

pub mod parsing;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::vfs::{ListingEntry, MutationBatch, NodeKind, NodeUpsert};

// ── Tool metadata ────────────────────────────────────────────

/// Metadata describing a call the model may emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMeta {
    /// Machine name (e.g. `"file_listing"`).
    pub name: String,
    /// Guidance for the model on when to use the call.
    pub description: String,
    /// JSON Schema object describing the arguments.
    pub args_schema: Value,
}

// ── Call kinds ───────────────────────────────────────────────

/// The closed set of structured calls available in multi-call mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    FileListing,
    FileContent,
    CommandOutput,
    ProcessList,
    SystemStatus,
    Remark,
    StateUpdate,
}

impl CallKind {
    pub const ALL: [CallKind; 7] = [
        CallKind::FileListing,
        CallKind::FileContent,
        CallKind::CommandOutput,
        CallKind::ProcessList,
        CallKind::SystemStatus,
        CallKind::Remark,
        CallKind::StateUpdate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CallKind::FileListing => "file_listing",
            CallKind::FileContent => "file_content",
            CallKind::CommandOutput => "command_output",
            CallKind::ProcessList => "process_list",
            CallKind::SystemStatus => "system_status",
            CallKind::Remark => "remark",
            CallKind::StateUpdate => "state_update",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

// ── Typed arguments ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileListing {
    /// Absolute path of the directory being listed.
    #[serde(alias = "path", alias = "directory")]
    pub cwd: String,
    pub entries: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: NodeKind,
    #[serde(default, deserialize_with = "lenient_string")]
    pub permissions: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub owner: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub group: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub size: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub modified: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub link_target: Option<String>,
}

impl From<&FileEntry> for ListingEntry {
    fn from(e: &FileEntry) -> Self {
        ListingEntry {
            name: e.name.clone(),
            kind: e.kind,
            permissions: e.permissions.clone(),
            owner: e.owner.clone(),
            group: e.group.clone(),
            size: e.size.clone(),
            modified: e.modified.clone(),
            link_target: e.link_target.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandOutput {
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProcessList {
    pub processes: Vec<ProcessEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProcessEntry {
    #[serde(deserialize_with = "lenient_pid")]
    pub pid: u64,
    pub user: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub cpu: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub mem: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vsz: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub rss: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub tty: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub stat: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub start: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub time: Option<String>,
    pub command: String,
}

/// Colour class of a status panel row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
    Inactive,
    #[default]
    Info,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SystemStatus {
    pub title: String,
    pub entries: Vec<StatusEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusEntry {
    pub label: String,
    #[serde(deserialize_with = "required_lenient_string")]
    pub value: String,
    #[serde(default, alias = "status")]
    pub severity: Option<Severity>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Remark {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct StateUpdate {
    #[serde(default, alias = "cwd")]
    pub directory: Option<String>,
    #[serde(default)]
    pub create: Vec<CreateEntry>,
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default, alias = "env")]
    pub environment: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateEntry {
    pub path: String,
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: Option<NodeKind>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub permissions: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub owner: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub group: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub size: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub modified: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub language: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub link_target: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl StateUpdate {
    /// Convert to the state store's mutation batch.
    pub fn to_batch(&self) -> MutationBatch {
        MutationBatch {
            directory: self.directory.clone(),
            create: self
                .create
                .iter()
                .map(|c| NodeUpsert {
                    path: c.path.clone(),
                    kind: c.kind,
                    permissions: c.permissions.clone(),
                    owner: c.owner.clone(),
                    group: c.group.clone(),
                    size: c.size.clone(),
                    modified: c.modified.clone(),
                    language: c.language.clone(),
                    link_target: c.link_target.clone(),
                    content: c.content.clone(),
                })
                .collect(),
            remove: self.remove.clone(),
            environment: self
                .environment
                .iter()
                .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s)))
                .collect(),
        }
    }
}

// ── ToolCall ─────────────────────────────────────────────────

/// A decoded structured call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    FileListing(FileListing),
    FileContent(FileContent),
    CommandOutput(CommandOutput),
    ProcessList(ProcessList),
    SystemStatus(SystemStatus),
    Remark(Remark),
    StateUpdate(StateUpdate),
    /// A well-formed call whose name is not registered.
    Unknown { name: String },
}

/// Why a call's raw payload was rejected.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{name}: arguments are not valid JSON ({source})")]
    Malformed {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{name}: arguments do not match the schema ({source})")]
    Shape {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{name}: arguments must be a JSON object")]
    NotAnObject { name: String },
}

/// Parse raw argument text into JSON without checking its shape.
pub fn parse_arguments(name: &str, raw: &str) -> Result<Value, DecodeError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw).map_err(|source| DecodeError::Malformed {
        name: name.to_string(),
        source,
    })
}

impl ToolCall {
    /// Parse the raw accumulated argument text of a call named `name`.
    ///
    /// An empty buffer counts as `{}` (services omit deltas for calls
    /// with no arguments).
    pub fn decode(name: &str, raw: &str) -> Result<Self, DecodeError> {
        Self::from_value(name, parse_arguments(name, raw)?)
    }

    /// Validate an already-parsed argument value.
    pub fn from_value(name: &str, value: Value) -> Result<Self, DecodeError> {
        if !value.is_object() {
            return Err(DecodeError::NotAnObject {
                name: name.to_string(),
            });
        }
        let Some(kind) = CallKind::from_name(name) else {
            return Ok(ToolCall::Unknown {
                name: name.to_string(),
            });
        };
        let shape = |source| DecodeError::Shape {
            name: name.to_string(),
            source,
        };
        let call = match kind {
            CallKind::FileListing => {
                ToolCall::FileListing(serde_json::from_value(value).map_err(shape)?)
            }
            CallKind::FileContent => {
                ToolCall::FileContent(serde_json::from_value(value).map_err(shape)?)
            }
            CallKind::CommandOutput => {
                ToolCall::CommandOutput(serde_json::from_value(value).map_err(shape)?)
            }
            CallKind::ProcessList => {
                ToolCall::ProcessList(serde_json::from_value(value).map_err(shape)?)
            }
            CallKind::SystemStatus => {
                ToolCall::SystemStatus(serde_json::from_value(value).map_err(shape)?)
            }
            CallKind::Remark => ToolCall::Remark(serde_json::from_value(value).map_err(shape)?),
            CallKind::StateUpdate => {
                ToolCall::StateUpdate(serde_json::from_value(value).map_err(shape)?)
            }
        };
        Ok(call)
    }

    pub fn kind(&self) -> Option<CallKind> {
        Some(match self {
            ToolCall::FileListing(_) => CallKind::FileListing,
            ToolCall::FileContent(_) => CallKind::FileContent,
            ToolCall::CommandOutput(_) => CallKind::CommandOutput,
            ToolCall::ProcessList(_) => CallKind::ProcessList,
            ToolCall::SystemStatus(_) => CallKind::SystemStatus,
            ToolCall::Remark(_) => CallKind::Remark,
            ToolCall::StateUpdate(_) => CallKind::StateUpdate,
            ToolCall::Unknown { .. } => return None,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            ToolCall::Unknown { name } => name,
            other => other.kind().map(CallKind::name).unwrap_or_default(),
        }
    }
}

// ── Registry ─────────────────────────────────────────────────

/// Name of the one call allowed in single-field mode.
pub const TERMINAL_OUTPUT: &str = "terminal_output";

/// Schemas for every multi-call [`CallKind`], in [`CallKind::ALL`] order.
pub fn list_tools() -> &'static [ToolMeta] {
    static REGISTRY: OnceLock<Vec<ToolMeta>> = OnceLock::new();
    REGISTRY.get_or_init(|| CallKind::ALL.into_iter().map(schema_for).collect())
}

/// The single-field call: one string argument named `field`.
pub fn terminal_output_tool(field: &str) -> ToolMeta {
    ToolMeta {
        name: TERMINAL_OUTPUT.into(),
        description: "Write raw terminal output. This is the only way to respond. \
                      The field holds exactly what the operator sees: plain text, \
                      \\x1b escape sequences for colour, no markdown. The prompt is \
                      printed for you."
            .into(),
        args_schema: json!({
            "type": "object",
            "properties": {
                field: {
                    "type": "string",
                    "description": "Exact terminal output of the command."
                }
            },
            "required": [field]
        }),
    }
}

fn schema_for(kind: CallKind) -> ToolMeta {
    let (description, args_schema) = match kind {
        CallKind::FileListing => (
            "Display a directory listing. Use when the operator runs ls or similar.",
            json!({
                "type": "object",
                "properties": {
                    "cwd": {
                        "type": "string",
                        "description": "Absolute path of the directory being listed"
                    },
                    "entries": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "type": { "type": "string", "enum": ["file", "dir", "symlink"] },
                                "permissions": { "type": "string", "description": "e.g. rwxr-xr-x" },
                                "owner": { "type": "string" },
                                "group": { "type": "string" },
                                "size": { "type": "string", "description": "Human-readable, e.g. 4.2K" },
                                "modified": { "type": "string", "description": "e.g. Mar 14 09:32" },
                                "link_target": { "type": "string", "description": "Symlink target path" }
                            },
                            "required": ["name", "type"]
                        }
                    }
                },
                "required": ["cwd", "entries"]
            }),
        ),
        CallKind::FileContent => (
            "Display raw file contents. Use when the operator runs cat, less, head and the like. \
             The content field holds the literal text of the file; for source files write real, \
             working code.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Absolute path of the file" },
                    "content": { "type": "string", "description": "The raw file content" },
                    "language": { "type": "string", "description": "Language identifier, e.g. rust, yaml" }
                },
                "required": ["path", "content"]
            }),
        ),
        CallKind::CommandOutput => (
            "Generic command output for anything without a dedicated call: grep, find, echo, \
             whoami, uname, git, tree, and so on.",
            json!({
                "type": "object",
                "properties": {
                    "lines": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Output lines, one string per terminal line"
                    }
                },
                "required": ["lines"]
            }),
        ),
        CallKind::ProcessList => (
            "Display running processes. Use when the operator runs ps or top.",
            json!({
                "type": "object",
                "properties": {
                    "processes": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "pid": { "type": "number" },
                                "user": { "type": "string" },
                                "cpu": { "type": "string" },
                                "mem": { "type": "string" },
                                "vsz": { "type": "string" },
                                "rss": { "type": "string" },
                                "tty": { "type": "string" },
                                "stat": { "type": "string" },
                                "start": { "type": "string" },
                                "time": { "type": "string" },
                                "command": { "type": "string" }
                            },
                            "required": ["pid", "user", "command"]
                        }
                    }
                },
                "required": ["processes"]
            }),
        ),
        CallKind::SystemStatus => (
            "Display a diagnostics panel with a title and labelled rows.",
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "entries": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "label": { "type": "string" },
                                "value": { "type": "string" },
                                "severity": {
                                    "type": "string",
                                    "enum": ["ok", "warning", "critical", "inactive", "info"]
                                }
                            },
                            "required": ["label", "value"]
                        }
                    }
                },
                "required": ["title", "entries"]
            }),
        ),
        CallKind::Remark => (
            "A brief remark from the machine itself, 1-3 sentences. Use after other calls \
             or alone for conversational replies.",
            json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Plain text, no formatting" }
                },
                "required": ["text"]
            }),
        ),
        CallKind::StateUpdate => (
            "Record changes to the machine state without printing anything: directory \
             changes, created or modified files, deletions, environment variables. Use \
             whenever a command would change the filesystem or environment.",
            json!({
                "type": "object",
                "properties": {
                    "directory": { "type": "string", "description": "New working directory" },
                    "create": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "path": { "type": "string" },
                                "type": { "type": "string", "enum": ["file", "dir", "symlink"] },
                                "permissions": { "type": "string" },
                                "owner": { "type": "string" },
                                "group": { "type": "string" },
                                "size": { "type": "string" },
                                "modified": { "type": "string" },
                                "language": { "type": "string" },
                                "link_target": { "type": "string" },
                                "content": { "type": "string" }
                            },
                            "required": ["path"]
                        }
                    },
                    "remove": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Absolute paths to delete, recursively"
                    },
                    "environment": {
                        "type": "object",
                        "additionalProperties": { "type": "string" }
                    }
                }
            }),
        ),
    };
    ToolMeta {
        name: kind.name().into(),
        description: description.into(),
        args_schema,
    }
}

// ── Lenient scalar helpers ───────────────────────────────────

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Accept strings, numbers and booleans for optional text fields.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(v) => scalar_to_string(&v)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("expected a string, found {v}"))),
    }
}

fn required_lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    scalar_to_string(&v).ok_or_else(|| D::Error::custom(format!("expected a string, found {v}")))
}

/// Process ids arrive as numbers or numeric strings.
fn lenient_pid<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .ok_or_else(|| D::Error::custom(format!("invalid pid {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid pid {s:?}"))),
        other => Err(D::Error::custom(format!("invalid pid {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_kind() {
        let names: Vec<&str> = list_tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "file_listing",
                "file_content",
                "command_output",
                "process_list",
                "system_status",
                "remark",
                "state_update"
            ]
        );
        for tool in list_tools() {
            assert_eq!(tool.args_schema["type"], "object");
        }
    }

    #[test]
    fn decode_listing_with_numeric_size() {
        let raw = r#"{"cwd":"/","entries":[{"name":"core.log","type":"file","size":2048}]}"#;
        let call = ToolCall::decode("file_listing", raw).unwrap();
        let ToolCall::FileListing(listing) = call else {
            panic!("expected listing");
        };
        assert_eq!(listing.entries[0].size.as_deref(), Some("2048"));
    }

    #[test]
    fn decode_rejects_missing_required_field() {
        let err = ToolCall::decode("file_content", r#"{"path":"/x"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Shape { .. }));
        assert!(err.to_string().contains("content"));
    }

    #[test]
    fn decode_rejects_truncated_json() {
        let err = ToolCall::decode("command_output", r#"{"lines":["a""#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn unknown_name_decodes_to_unknown() {
        let call = ToolCall::decode("launch_missiles", "{}").unwrap();
        assert_eq!(
            call,
            ToolCall::Unknown {
                name: "launch_missiles".into()
            }
        );
        assert_eq!(call.name(), "launch_missiles");
    }

    #[test]
    fn pid_accepts_strings() {
        let raw = r#"{"processes":[{"pid":"42","user":"root","command":"init"}]}"#;
        let ToolCall::ProcessList(list) = ToolCall::decode("process_list", raw).unwrap() else {
            panic!("expected process list");
        };
        assert_eq!(list.processes[0].pid, 42);
    }

    #[test]
    fn state_update_converts_env_scalars() {
        let raw = r#"{"cwd":"/tmp","env":{"DEBUG":true,"PORT":8080,"NAME":"x"}}"#;
        let ToolCall::StateUpdate(update) = ToolCall::decode("state_update", raw).unwrap() else {
            panic!("expected state update");
        };
        let batch = update.to_batch();
        assert_eq!(batch.directory.as_deref(), Some("/tmp"));
        assert_eq!(batch.environment["DEBUG"], "true");
        assert_eq!(batch.environment["PORT"], "8080");
    }

    #[test]
    fn terminal_output_schema_uses_field_name() {
        let tool = terminal_output_tool("screen");
        assert_eq!(tool.args_schema["required"][0], "screen");
        assert!(tool.args_schema["properties"]["screen"].is_object());
    }
}

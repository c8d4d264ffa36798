//! Generic OpenAI-compatible provider.
//!
//! Works with any API that implements the OpenAI chat completions
//! interface with streamed `tool_calls`: OpenRouter, Ollama, Groq,
//! vLLM, LM Studio, etc.  Streamed tool-call deltas are regrouped into
//! the same block events the Anthropic adapter produces.
//!
//! Config example:
//! ```yaml
//! model:
//!   provider: openai-compat
//!   model: llama3.1
//!   endpoint: http://localhost:11434/v1/chat/completions
//!   api_key: $OLLAMA_KEY   # optional, some local servers need none
//! ```

use std::any::Any;
use std::collections::BTreeMap;

use anyhow::Context as _;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::warn;

use super::{
    wire_messages, BlockDelta, BlockKind, ChatMessage, ContentBlock, EventStream, ModelProvider,
    Role, SseLines, StreamEvent, ToolChoice, TurnRequest,
};

/// Provider that talks to any OpenAI-compatible chat completions API.
pub struct OpenAICompatProvider {
    api_key: String,
    endpoint: String,
    model: String,
    client: Client,
}

impl OpenAICompatProvider {
    /// `api_key` may be empty for local servers that don't require auth.
    pub fn new(endpoint: String, api_key: String, model: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            api_key,
            endpoint,
            model,
            client,
        })
    }

    pub fn request_body(&self, request: &TurnRequest) -> Value {
        let mut messages = Vec::new();
        if !request.system.is_empty() {
            messages.push(json!({ "role": "system", "content": request.system }));
        }
        for msg in wire_messages(&request.messages) {
            messages.extend(message_json(&msg));
        }
        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "stream": true,
            "messages": messages,
        });
        let choice = match &request.tool_choice {
            ToolChoice::None => None,
            ToolChoice::Any => Some(json!("required")),
            ToolChoice::Tool(name) => {
                Some(json!({ "type": "function", "function": { "name": name } }))
            }
        };
        if let Some(choice) = choice {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.args_schema,
                        }
                    })
                })
                .collect();
            body["tool_choice"] = choice;
        }
        body
    }
}

/// One history turn as chat-completions messages.  Tool results become
/// separate `tool` role messages ahead of any operator text.
fn message_json(msg: &ChatMessage) -> Vec<Value> {
    let text = msg.text();
    match msg.role {
        Role::Assistant => {
            let tool_calls: Vec<Value> = msg
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some(json!({
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": input.to_string() }
                    })),
                    _ => None,
                })
                .collect();
            let mut out = json!({ "role": "assistant" });
            out["content"] = if text.is_empty() && !tool_calls.is_empty() {
                Value::Null
            } else {
                json!(text)
            };
            if !tool_calls.is_empty() {
                out["tool_calls"] = json!(tool_calls);
            }
            vec![out]
        }
        Role::User => {
            let mut out: Vec<Value> = msg
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => Some(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    })),
                    _ => None,
                })
                .collect();
            if !text.is_empty() {
                out.push(json!({ "role": "user", "content": text }));
            }
            out
        }
    }
}

// ---------------------------------------------------------------------------
// Delta regrouping
// ---------------------------------------------------------------------------

/// Turns chat-completions chunks into block events.
///
/// Text and each distinct `tool_calls[].index` get their own block; a
/// block is closed as soon as a different one starts, and everything
/// still open is closed by `finish_reason` or end of stream.
#[derive(Debug, Default)]
pub struct DeltaGrouper {
    next_block: usize,
    text_block: Option<usize>,
    tool_blocks: BTreeMap<u64, usize>,
    current: Option<usize>,
    finished: bool,
}

impl DeltaGrouper {
    pub fn push(&mut self, chunk: &Value) -> anyhow::Result<Vec<StreamEvent>> {
        if let Some(err) = chunk.get("error") {
            let message = err["message"].as_str().unwrap_or("unknown error");
            anyhow::bail!("OpenAI-compat stream error: {message}");
        }
        let mut events = Vec::new();
        let choice = &chunk["choices"][0];
        let delta = &choice["delta"];

        if let Some(content) = delta["content"].as_str().filter(|c| !c.is_empty()) {
            let index = match self.text_block {
                Some(i) => i,
                None => {
                    let i = self.open(BlockKind::Text, &mut events);
                    self.text_block = Some(i);
                    i
                }
            };
            self.switch_to(index, &mut events);
            events.push(StreamEvent::BlockDelta {
                index,
                delta: BlockDelta::Text(content.to_string()),
            });
        }

        for call in delta["tool_calls"].as_array().into_iter().flatten() {
            let key = call["index"].as_u64().unwrap_or(0);
            let args = call["function"]["arguments"].as_str().filter(|a| !a.is_empty());
            let index = match self.tool_blocks.get(&key) {
                Some(&i) if self.current != Some(i) => {
                    if let Some(args) = args {
                        warn!(
                            tool_index = key,
                            block = i,
                            dropped = args.len(),
                            "argument delta arrived after its call was closed"
                        );
                    }
                    continue;
                }
                Some(&i) => i,
                None => {
                    let id = call["id"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{key}"));
                    let name = call["function"]["name"].as_str().unwrap_or_default().to_string();
                    let i = self.open(BlockKind::ToolUse { id, name }, &mut events);
                    self.tool_blocks.insert(key, i);
                    i
                }
            };
            self.switch_to(index, &mut events);
            if let Some(args) = args {
                events.push(StreamEvent::BlockDelta {
                    index,
                    delta: BlockDelta::InputJson(args.to_string()),
                });
            }
        }

        if choice["finish_reason"].is_string() {
            events.extend(self.finish());
        }
        Ok(events)
    }

    /// Whether a `finish_reason` has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Close whatever is still open.  Idempotent.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        self.current
            .take()
            .map(|index| StreamEvent::BlockStop { index })
            .into_iter()
            .collect()
    }

    fn open(&mut self, block: BlockKind, events: &mut Vec<StreamEvent>) -> usize {
        self.close_current(events);
        let index = self.next_block;
        self.next_block += 1;
        self.current = Some(index);
        events.push(StreamEvent::BlockStart { index, block });
        index
    }

    /// Text resuming after a call opens a fresh text block.  Calls are
    /// never reopened; late argument deltas are dropped in `push`.
    fn switch_to(&mut self, index: usize, events: &mut Vec<StreamEvent>) {
        if self.current.is_some_and(|c| c != index) {
            self.close_current(events);
        }
    }

    fn close_current(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(prev) = self.current.take() {
            if self.text_block == Some(prev) {
                self.text_block = None;
            }
            events.push(StreamEvent::BlockStop { index: prev });
        }
    }
}

impl ModelProvider for OpenAICompatProvider {
    fn stream_turn<'a>(&'a self, request: &'a TurnRequest) -> EventStream<'a> {
        Box::pin(async_stream::try_stream! {
            let body = self.request_body(request);
            let mut req = self.client.post(&self.endpoint).json(&body);
            if !self.api_key.is_empty() {
                req = req.bearer_auth(&self.api_key);
            }
            let resp = req.send().await.context("OpenAI-compat request failed")?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                Err(anyhow::anyhow!("OpenAI-compat API returned {status}: {text}"))?;
                return;
            }

            use tokio_stream::StreamExt as _;
            let mut byte_stream = resp.bytes_stream();
            let mut sse = SseLines::default();
            let mut grouper = DeltaGrouper::default();

            let mut done = false;
            'read: while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk.context("OpenAI-compat stream interrupted")?;
                for payload in sse.push(&chunk) {
                    if payload == "[DONE]" {
                        done = true;
                        break 'read;
                    }
                    let Ok(json) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };
                    for event in grouper.push(&json)? {
                        yield event;
                    }
                }
            }
            if !done && !grouper.is_finished() {
                Err(anyhow::anyhow!("OpenAI-compat stream ended before [DONE]"))?;
            }
            for event in grouper.finish() {
                yield event;
            }
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAICompatProvider {
        OpenAICompatProvider::new(
            "http://localhost:11434/v1/chat/completions".into(),
            String::new(),
            "llama3".into(),
        )
        .unwrap()
    }

    #[test]
    fn construct_with_empty_key() {
        let p = provider();
        assert_eq!(p.model, "llama3");
        assert!(p.api_key.is_empty());
    }

    #[test]
    fn body_forces_named_function() {
        let request = TurnRequest {
            system: "sys".into(),
            messages: vec![ChatMessage::user("ls")],
            tools: vec![crate::tools::terminal_output_tool("output")],
            tool_choice: ToolChoice::Tool("terminal_output".into()),
            max_tokens: 100,
        };
        let body = provider().request_body(&request);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "ls");
        assert_eq!(body["tool_choice"]["function"]["name"], "terminal_output");
        assert_eq!(body["tools"][0]["function"]["name"], "terminal_output");
    }

    #[test]
    fn tool_results_become_tool_messages() {
        let msg = ChatMessage {
            role: Role::User,
            content: vec![
                ContentBlock::ToolResult {
                    tool_use_id: "c1".into(),
                    content: "ok".into(),
                },
                ContentBlock::Text("pwd".into()),
            ],
        };
        let out = message_json(&msg);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["role"], "tool");
        assert_eq!(out[0]["tool_call_id"], "c1");
        assert_eq!(out[1]["content"], "pwd");
    }

    #[test]
    fn grouper_closes_previous_call_on_new_index() {
        let mut g = DeltaGrouper::default();
        let first = g
            .push(&json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"a","function":{"name":"remark","arguments":"{\"text\":"}}
            ]}}]}))
            .unwrap();
        assert_eq!(first.len(), 2);
        let second = g
            .push(&json!({"choices":[{"delta":{"tool_calls":[
                {"index":1,"id":"b","function":{"name":"command_output","arguments":""}}
            ]}}]}))
            .unwrap();
        assert_eq!(second[0], StreamEvent::BlockStop { index: 0 });
        assert!(matches!(second[1], StreamEvent::BlockStart { index: 1, .. }));
        let done = g
            .push(&json!({"choices":[{"delta":{},"finish_reason":"tool_calls"}]}))
            .unwrap();
        assert_eq!(done, vec![StreamEvent::BlockStop { index: 1 }]);
        assert!(g.finish().is_empty());
    }

    #[test]
    fn grouper_drops_arguments_for_a_closed_call() {
        let mut g = DeltaGrouper::default();
        g.push(&json!({"choices":[{"delta":{"tool_calls":[
            {"index":0,"id":"a","function":{"name":"remark","arguments":"{\"text\":"}}
        ]}}]}))
        .unwrap();
        g.push(&json!({"choices":[{"delta":{"tool_calls":[
            {"index":1,"id":"b","function":{"name":"command_output","arguments":"{"}}
        ]}}]}))
        .unwrap();

        let late = g
            .push(&json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"function":{"arguments":"\"hi\"}"}}
            ]}}]}))
            .unwrap();
        assert!(late.is_empty(), "{late:?}");

        let resumed = g
            .push(&json!({"choices":[{"delta":{"tool_calls":[
                {"index":1,"function":{"arguments":"}"}}
            ]}}]}))
            .unwrap();
        assert_eq!(
            resumed,
            vec![StreamEvent::BlockDelta {
                index: 1,
                delta: BlockDelta::InputJson("}".into())
            }]
        );
        assert_eq!(g.finish(), vec![StreamEvent::BlockStop { index: 1 }]);
    }

    #[test]
    fn grouper_streams_text() {
        let mut g = DeltaGrouper::default();
        let events = g
            .push(&json!({"choices":[{"delta":{"content":"hi"}}]}))
            .unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::BlockStart {
                    index: 0,
                    block: BlockKind::Text
                },
                StreamEvent::BlockDelta {
                    index: 0,
                    delta: BlockDelta::Text("hi".into())
                }
            ]
        );
    }

    #[test]
    fn as_any_downcast() {
        let p = provider();
        let provider: &dyn ModelProvider = &p;
        assert!(provider.as_any().downcast_ref::<OpenAICompatProvider>().is_some());
    }
}

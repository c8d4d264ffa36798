//! Anthropic Messages API provider.
//!
//! Streams `content_block_start` / `content_block_delta` /
//! `content_block_stop` server-sent events and maps them one-to-one onto
//! [`StreamEvent`]s.
//!
//! Config example:
//! ```yaml
//! model:
//!   provider: anthropic
//!   model: claude-sonnet-4-20250514
//!   api_key: $ANTHROPIC_API_KEY
//! ```

use std::any::Any;

use anyhow::Context as _;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    wire_messages, BlockDelta, BlockKind, ChatMessage, ContentBlock, EventStream, ModelProvider,
    SseLines, StreamEvent, ToolChoice, TurnRequest,
};

pub const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Provider for the Anthropic Messages API.
pub struct AnthropicProvider {
    api_key: String,
    endpoint: String,
    model: String,
    client: Client,
}

impl AnthropicProvider {
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

    /// JSON body for one streamed turn.
    pub fn request_body(&self, request: &TurnRequest) -> Value {
        let messages: Vec<Value> = wire_messages(&request.messages)
            .iter()
            .map(message_json)
            .collect();
        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "stream": true,
            "messages": messages,
        });
        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }
        let choice = match &request.tool_choice {
            ToolChoice::None => None,
            ToolChoice::Any => Some(json!({ "type": "any" })),
            ToolChoice::Tool(name) => Some(json!({ "type": "tool", "name": name })),
        };
        if let Some(choice) = choice {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.args_schema,
                    })
                })
                .collect();
            body["tool_choice"] = choice;
        }
        body
    }
}

fn message_json(msg: &ChatMessage) -> Value {
    let content: Vec<Value> = msg
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text(text) => json!({ "type": "text", "text": text }),
            ContentBlock::ToolUse { id, name, input } => {
                json!({ "type": "tool_use", "id": id, "name": name, "input": input })
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => json!({ "type": "tool_result", "tool_use_id": tool_use_id, "content": content }),
        })
        .collect();
    json!({ "role": msg.role.as_str(), "content": content })
}

/// Map one SSE payload onto stream events.
///
/// Events the bridge has no use for (`message_start`, `message_delta`,
/// `ping`) map to nothing; an `error` event becomes an `Err`.
pub fn parse_event(data: &Value) -> anyhow::Result<Vec<StreamEvent>> {
    let index = data["index"].as_u64().unwrap_or(0) as usize;
    let events = match data["type"].as_str().unwrap_or("") {
        "content_block_start" => {
            let block = &data["content_block"];
            match block["type"].as_str() {
                Some("tool_use") => vec![StreamEvent::BlockStart {
                    index,
                    block: BlockKind::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                    },
                }],
                Some("text") => {
                    let mut events = vec![StreamEvent::BlockStart {
                        index,
                        block: BlockKind::Text,
                    }];
                    if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                        events.push(StreamEvent::BlockDelta {
                            index,
                            delta: BlockDelta::Text(text.to_string()),
                        });
                    }
                    events
                }
                other => {
                    debug!(block_type = ?other, "ignoring content block");
                    Vec::new()
                }
            }
        }
        "content_block_delta" => {
            let delta = &data["delta"];
            match delta["type"].as_str() {
                Some("text_delta") => vec![StreamEvent::BlockDelta {
                    index,
                    delta: BlockDelta::Text(delta["text"].as_str().unwrap_or_default().to_string()),
                }],
                Some("input_json_delta") => vec![StreamEvent::BlockDelta {
                    index,
                    delta: BlockDelta::InputJson(
                        delta["partial_json"].as_str().unwrap_or_default().to_string(),
                    ),
                }],
                _ => Vec::new(),
            }
        }
        "content_block_stop" => vec![StreamEvent::BlockStop { index }],
        "error" => {
            let kind = data["error"]["type"].as_str().unwrap_or("error");
            let message = data["error"]["message"].as_str().unwrap_or("unknown error");
            anyhow::bail!("Anthropic stream error ({kind}): {message}");
        }
        _ => Vec::new(),
    };
    Ok(events)
}

impl ModelProvider for AnthropicProvider {
    fn stream_turn<'a>(&'a self, request: &'a TurnRequest) -> EventStream<'a> {
        Box::pin(async_stream::try_stream! {
            let body = self.request_body(request);
            let resp = self
                .client
                .post(&self.endpoint)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
                .context("Anthropic request failed")?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                Err(anyhow::anyhow!("Anthropic API returned {status}: {text}"))?;
                return;
            }

            use tokio_stream::StreamExt as _;
            let mut byte_stream = resp.bytes_stream();
            let mut sse = SseLines::default();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk.context("Anthropic stream interrupted")?;
                for payload in sse.push(&chunk) {
                    let Ok(data) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };
                    if data["type"] == "message_stop" {
                        return;
                    }
                    for event in parse_event(&data)? {
                        yield event;
                    }
                }
            }
            Err(anyhow::anyhow!("Anthropic stream ended before message_stop"))?;
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::list_tools;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(
            DEFAULT_ENDPOINT.into(),
            "sk-test".into(),
            "claude-test".into(),
        )
        .unwrap()
    }

    fn request(choice: ToolChoice) -> TurnRequest {
        TurnRequest {
            system: "You are a machine.".into(),
            messages: vec![ChatMessage::user("ls")],
            tools: list_tools().to_vec(),
            tool_choice: choice,
            max_tokens: 1024,
        }
    }

    #[test]
    fn body_forces_any_tool() {
        let body = provider().request_body(&request(ToolChoice::Any));
        assert_eq!(body["tool_choice"]["type"], "any");
        assert_eq!(body["tools"].as_array().unwrap().len(), list_tools().len());
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["system"], "You are a machine.");
        assert_eq!(body["messages"][0]["content"][0]["text"], "ls");
    }

    #[test]
    fn text_mode_sends_no_tools() {
        let body = provider().request_body(&request(ToolChoice::None));
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn parses_tool_use_lifecycle() {
        let start = json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": {"type": "tool_use", "id": "toolu_1", "name": "remark", "input": {}}
        });
        let delta = json!({
            "type": "content_block_delta",
            "index": 1,
            "delta": {"type": "input_json_delta", "partial_json": "{\"te"}
        });
        assert_eq!(
            parse_event(&start).unwrap(),
            vec![StreamEvent::BlockStart {
                index: 1,
                block: BlockKind::ToolUse {
                    id: "toolu_1".into(),
                    name: "remark".into()
                }
            }]
        );
        assert_eq!(
            parse_event(&delta).unwrap(),
            vec![StreamEvent::BlockDelta {
                index: 1,
                delta: BlockDelta::InputJson("{\"te".into())
            }]
        );
        assert_eq!(
            parse_event(&json!({"type": "content_block_stop", "index": 1})).unwrap(),
            vec![StreamEvent::BlockStop { index: 1 }]
        );
    }

    #[test]
    fn error_event_is_an_error() {
        let err = parse_event(&json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Overloaded"));
    }

    #[test]
    fn as_any_downcast() {
        let p = provider();
        let provider: &dyn ModelProvider = &p;
        assert!(provider.as_any().downcast_ref::<AnthropicProvider>().is_some());
    }
}

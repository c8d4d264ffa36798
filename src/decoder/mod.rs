//! Turn decoder: provider events in, terminal text and state changes out.
//!
//! A [`TurnDecoder`] is built per turn.  Each [`StreamEvent`] is fed in
//! arrival order; whatever should be shown to the operator right now is
//! returned as text (bare `\n` line endings), and completed calls are
//! applied to the [`SessionState`] in the order their blocks close.
//! [`TurnDecoder::finish`] yields the turns to append to the history.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::models::{BlockDelta, BlockKind, ChatMessage, ContentBlock, Role, StreamEvent};
use crate::render::{render, render_diagnostic};
use crate::tools::parsing::FieldExtractor;
use crate::tools::{parse_arguments, ToolCall};
use crate::vfs::SessionState;

/// Acknowledgement text sent back for every applied call.
pub const ACKNOWLEDGEMENT: &str = "displayed";

/// How the model's reply is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeMode {
    /// Free text is the output.
    Text,
    /// One call, one string field streamed character by character.
    SingleField { field: String },
    /// Any number of registered calls per turn.
    MultiCall,
}

#[derive(Debug)]
enum OpenBlock {
    Text,
    Call { id: String, name: String, raw: String },
    Field { id: String, name: String, extractor: FieldExtractor },
}

/// A call that was decoded and applied.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// What a finished turn leaves behind.
#[derive(Debug, Default)]
pub struct TurnOutcome {
    /// The model's side of the turn, if it produced anything usable.
    pub assistant: Option<ChatMessage>,
    /// Synthetic operator-side turn acknowledging each applied call.
    pub acknowledgement: Option<ChatMessage>,
    /// Calls applied, in block-close order.
    pub applied: Vec<AppliedCall>,
    /// Calls dropped for decode failures or because the stream ended early.
    pub discarded: usize,
}

/// Per-turn stream state machine.
#[derive(Debug)]
pub struct TurnDecoder {
    mode: DecodeMode,
    open: HashMap<usize, OpenBlock>,
    /// Assistant content in block-close order.
    content: Vec<ContentBlock>,
    applied: Vec<AppliedCall>,
    discarded: usize,
    /// Whether the last emitted character was something other than `\n`.
    mid_line: bool,
}

impl TurnDecoder {
    pub fn new(mode: DecodeMode) -> Self {
        Self {
            mode,
            open: HashMap::new(),
            content: Vec::new(),
            applied: Vec::new(),
            discarded: 0,
            mid_line: false,
        }
    }

    /// True when output so far does not end at the start of a line.
    pub fn mid_line(&self) -> bool {
        self.mid_line
    }

    /// Feed one event; returns text to show the operator now.
    pub fn feed(&mut self, event: StreamEvent, state: &mut SessionState) -> String {
        let out = match event {
            StreamEvent::BlockStart { index, block } => {
                self.start(index, block);
                String::new()
            }
            StreamEvent::BlockDelta { index, delta } => self.delta(index, delta),
            StreamEvent::BlockStop { index } => self.stop(index, state),
        };
        if let Some(last) = out.chars().last() {
            self.mid_line = last != '\n';
        }
        out
    }

    fn start(&mut self, index: usize, block: BlockKind) {
        let open = match (block, &self.mode) {
            (BlockKind::Text, _) => OpenBlock::Text,
            (BlockKind::ToolUse { id, name }, DecodeMode::SingleField { field }) => {
                OpenBlock::Field {
                    id,
                    name,
                    extractor: FieldExtractor::new(field.clone()),
                }
            }
            (BlockKind::ToolUse { id, name }, _) => OpenBlock::Call {
                id,
                name,
                raw: String::new(),
            },
        };
        if self.open.insert(index, open).is_some() {
            warn!(index, "block reopened before stop; previous block dropped");
            self.discarded += 1;
        }
    }

    fn delta(&mut self, index: usize, delta: BlockDelta) -> String {
        let Some(block) = self.open.get_mut(&index) else {
            debug!(index, "delta for unknown block ignored");
            return String::new();
        };
        match (block, delta) {
            (OpenBlock::Text, BlockDelta::Text(text)) => {
                push_text(&mut self.content, &text);
                text
            }
            (OpenBlock::Call { raw, .. }, BlockDelta::InputJson(part)) => {
                raw.push_str(&part);
                String::new()
            }
            (OpenBlock::Field { extractor, .. }, BlockDelta::InputJson(part)) => {
                extractor.feed(&part)
            }
            (_, other) => {
                debug!(index, delta = ?other, "mismatched delta ignored");
                String::new()
            }
        }
    }

    fn stop(&mut self, index: usize, state: &mut SessionState) -> String {
        match self.open.remove(&index) {
            None | Some(OpenBlock::Text) => String::new(),
            Some(OpenBlock::Call { id, name, raw }) => self.close_call(id, name, &raw, state),
            Some(OpenBlock::Field {
                id,
                name,
                extractor,
            }) => self.close_field(id, name, extractor),
        }
    }

    fn close_call(&mut self, id: String, name: String, raw: &str, state: &mut SessionState) -> String {
        let decoded = parse_arguments(&name, raw)
            .and_then(|input| ToolCall::from_value(&name, input.clone()).map(|call| (input, call)));
        let (input, call) = match decoded {
            Ok(ok) => ok,
            Err(err) => {
                warn!(call = %name, error = %err, "discarding undecodable call");
                self.discarded += 1;
                return format!("{}\n", render_diagnostic(&err.to_string()));
            }
        };

        apply(&call, state);
        let rendered = render(&call);

        if let ToolCall::Unknown { .. } = call {
            warn!(call = %name, "model used an unregistered call");
            self.discarded += 1;
        } else {
            self.content.push(ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            });
            self.applied.push(AppliedCall { id, name, input });
        }

        if rendered.is_empty() {
            rendered
        } else {
            format!("{rendered}\n")
        }
    }

    fn close_field(&mut self, id: String, name: String, extractor: FieldExtractor) -> String {
        let field = match &self.mode {
            DecodeMode::SingleField { field } => field.clone(),
            _ => String::new(),
        };
        if extractor.is_complete() {
            let input = json!({ field: extractor.text() });
            self.content.push(ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            });
            self.applied.push(AppliedCall { id, name, input });
            return String::new();
        }

        // The field never streamed as a plain string; the whole object may
        // still hold it (e.g. a number, or keys the matcher skipped).
        if !extractor.found() {
            if let Ok(Value::Object(map)) = parse_arguments(&name, extractor.raw()) {
                if let Some(value) = map.get(&field) {
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let input = json!({ field: text.clone() });
                    self.content.push(ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                    self.applied.push(AppliedCall { id, name, input });
                    return text;
                }
            }
        }

        warn!(call = %name, field = %field, "single-field call ended without a complete value");
        self.discarded += 1;
        self.keep_partial(&extractor);
        let lead = if extractor.text().ends_with('\n') || extractor.text().is_empty() {
            ""
        } else {
            "\n"
        };
        format!(
            "{lead}{}\n",
            render_diagnostic(&format!("{name}: missing or unterminated \"{field}\""))
        )
    }

    /// Text already shown from a broken field stays in the history as
    /// plain model text so later turns match what the operator saw.
    fn keep_partial(&mut self, extractor: &FieldExtractor) {
        if !extractor.text().is_empty() {
            push_text(&mut self.content, extractor.text());
        }
    }

    /// Close the turn.  Blocks still open (stream cut short) are dropped,
    /// except partially streamed fields, which are kept as text.
    pub fn finish(mut self) -> TurnOutcome {
        let mut leftover: Vec<(usize, OpenBlock)> = self.open.drain().collect();
        leftover.sort_by_key(|(index, _)| *index);
        for (_, block) in leftover {
            match block {
                OpenBlock::Text => {}
                OpenBlock::Call { name, .. } => {
                    debug!(call = %name, "dropping call left open at end of stream");
                    self.discarded += 1;
                }
                OpenBlock::Field { extractor, .. } => {
                    self.discarded += 1;
                    self.keep_partial(&extractor);
                }
            }
        }

        let acknowledgement = (!self.applied.is_empty()).then(|| ChatMessage {
            role: Role::User,
            content: self
                .applied
                .iter()
                .map(|call| ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content: ACKNOWLEDGEMENT.to_string(),
                })
                .collect(),
        });
        let assistant = (!self.content.is_empty()).then(|| ChatMessage {
            role: Role::Assistant,
            content: self.content,
        });

        TurnOutcome {
            assistant,
            acknowledgement,
            applied: self.applied,
            discarded: self.discarded,
        }
    }
}

/// Append to the trailing text block or start a new one.
fn push_text(content: &mut Vec<ContentBlock>, text: &str) {
    if let Some(ContentBlock::Text(last)) = content.last_mut() {
        last.push_str(text);
    } else {
        content.push(ContentBlock::Text(text.to_string()));
    }
}

/// Mirror a call's facts into the state store.
pub fn apply(call: &ToolCall, state: &mut SessionState) {
    match call {
        ToolCall::FileListing(listing) => {
            let entries: Vec<_> = listing.entries.iter().map(Into::into).collect();
            state.record_listing(&listing.cwd, &entries);
        }
        ToolCall::FileContent(file) => {
            state.record_content(&file.path, &file.content, file.language.as_deref());
        }
        ToolCall::StateUpdate(update) => {
            let batch = update.to_batch();
            if batch.is_empty() {
                debug!("state_update carried no changes");
            } else {
                state.apply_mutations(&batch);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(index: usize, name: &str) -> StreamEvent {
        StreamEvent::BlockStart {
            index,
            block: BlockKind::ToolUse {
                id: format!("id{index}"),
                name: name.into(),
            },
        }
    }

    fn json_delta(index: usize, part: &str) -> StreamEvent {
        StreamEvent::BlockDelta {
            index,
            delta: BlockDelta::InputJson(part.into()),
        }
    }

    #[test]
    fn empty_state_update_leaves_state_alone() {
        let mut state = SessionState::new();
        state.set_current_directory("/srv");
        let before = state.serialize();
        let call = ToolCall::from_value("state_update", json!({})).unwrap();
        apply(&call, &mut state);
        assert_eq!(state.serialize(), before);
        assert_eq!(state.current_directory(), "/srv");
    }

    #[test]
    fn interleaved_blocks_apply_in_close_order() {
        let mut state = SessionState::new();
        let mut dec = TurnDecoder::new(DecodeMode::MultiCall);
        let mut out = String::new();
        for ev in [
            start(0, "command_output"),
            start(1, "remark"),
            json_delta(1, r#"{"text":"second"}"#),
            json_delta(0, r#"{"lines":["first"]}"#),
            StreamEvent::BlockStop { index: 1 },
            StreamEvent::BlockStop { index: 0 },
        ] {
            out.push_str(&dec.feed(ev, &mut state));
        }
        assert!(out.find("second").unwrap() < out.find("first").unwrap());
        let outcome = dec.finish();
        assert_eq!(outcome.applied[0].name, "remark");
        assert_eq!(outcome.applied[1].name, "command_output");
    }

    #[test]
    fn field_streams_before_stop() {
        let mut state = SessionState::new();
        let mut dec = TurnDecoder::new(DecodeMode::SingleField {
            field: "output".into(),
        });
        dec.feed(start(0, "terminal_output"), &mut state);
        assert_eq!(dec.feed(json_delta(0, r#"{"output":"ab"#), &mut state), "ab");
        assert!(dec.mid_line());
        assert_eq!(dec.feed(json_delta(0, r#"c\n"}"#), &mut state), "c\n");
        assert_eq!(dec.feed(StreamEvent::BlockStop { index: 0 }, &mut state), "");
        let outcome = dec.finish();
        assert_eq!(outcome.applied[0].input, json!({"output": "abc\n"}));
        assert!(outcome.acknowledgement.is_some());
    }

    #[test]
    fn unterminated_field_keeps_partial_text() {
        let mut state = SessionState::new();
        let mut dec = TurnDecoder::new(DecodeMode::SingleField {
            field: "output".into(),
        });
        dec.feed(start(0, "terminal_output"), &mut state);
        dec.feed(json_delta(0, r#"{"output":"half"#), &mut state);
        let out = dec.feed(StreamEvent::BlockStop { index: 0 }, &mut state);
        assert!(out.starts_with('\n'));
        assert!(out.contains("decode error"));
        let outcome = dec.finish();
        assert!(outcome.applied.is_empty());
        assert!(outcome.acknowledgement.is_none());
        assert_eq!(outcome.assistant.unwrap().text(), "half");
    }

    #[test]
    fn non_string_field_falls_back_to_whole_object() {
        let mut state = SessionState::new();
        let mut dec = TurnDecoder::new(DecodeMode::SingleField {
            field: "output".into(),
        });
        dec.feed(start(0, "terminal_output"), &mut state);
        dec.feed(json_delta(0, r#"{"output": 42}"#), &mut state);
        assert_eq!(dec.feed(StreamEvent::BlockStop { index: 0 }, &mut state), "42");
    }

    #[test]
    fn stream_cut_mid_call_discards_it() {
        let mut state = SessionState::new();
        let mut dec = TurnDecoder::new(DecodeMode::MultiCall);
        dec.feed(start(0, "state_update"), &mut state);
        dec.feed(json_delta(0, r#"{"directory":"/tmp""#), &mut state);
        let outcome = dec.finish();
        assert_eq!(outcome.discarded, 1);
        assert!(outcome.assistant.is_none());
        assert_eq!(state.current_directory(), "/");
    }
}

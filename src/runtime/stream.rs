//! Stream chunk taxonomy and the processor that turns a raw LLM stream
//! into assistant text, reasoning, and dispatched tool calls.
//!
//! Grounded on `crewai::llms::streaming`: `StreamChunk`, `StreamReceiver`,
//! and `ChannelStreamReceiver` map closely onto this module's
//! `RuntimeStreamChunk` / `RawStreamReceiver`, generalized so a single
//! `ToolCallDelta` variant becomes the three-part
//! start/delta/end sequence this runtime's dispatcher needs to stream
//! tool-call arguments incrementally.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::dispatcher::{ToolCallRequest, ToolDispatcher};
use super::errors::RuntimeError;
use super::message::{ContentPart, Message, MessageContent, Role};
use super::sink::ResponseEvent;

/// One chunk of a raw provider stream, before tool-call assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawStreamChunk {
    TextDelta { text: String },
    ReasoningDelta { text: String },
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, partial_json: String },
    ToolCallEnd { id: String },
    Error { message: String },
    Finish { message_id: String },
}

/// Async source of [`RawStreamChunk`]s, implemented by the LLM transport
/// contract (`crate::runtime::contracts::LlmTransport::prompt_stream`).
#[async_trait]
pub trait RawStreamReceiver: Send {
    /// Returns `None` once the stream ends.
    async fn next_chunk(&mut self) -> Option<RawStreamChunk>;
}

/// A tokio mpsc-backed receiver, the concrete shape callers building a
/// fake or real transport will normally reach for.
pub struct ChannelStreamReceiver {
    rx: mpsc::Receiver<RawStreamChunk>,
}

impl ChannelStreamReceiver {
    pub fn new(rx: mpsc::Receiver<RawStreamChunk>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl RawStreamReceiver for ChannelStreamReceiver {
    async fn next_chunk(&mut self) -> Option<RawStreamChunk> {
        self.rx.recv().await
    }
}

struct InProgressToolCall {
    id: String,
    name: String,
    partial_json: String,
}

/// Result of consuming one LLM turn's stream to completion.
pub struct StreamOutcome {
    pub assistant_text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tool_messages: Vec<Message>,
    pub had_tool_call_error: bool,
    pub message_id: Option<String>,
}

/// Drives a [`RawStreamReceiver`] to completion, extracting assistant
/// text, reasoning deltas, and tool calls, dispatching each call through
/// `dispatcher` in the order it was opened, and forwarding every event to
/// `sink` as it happens.
pub struct StreamProcessor<'a> {
    dispatcher: &'a mut ToolDispatcher,
}

impl<'a> StreamProcessor<'a> {
    pub fn new(dispatcher: &'a mut ToolDispatcher) -> Self {
        Self { dispatcher }
    }

    pub async fn run(
        &mut self,
        mut receiver: Box<dyn RawStreamReceiver>,
        sink: &dyn Fn(ResponseEvent),
    ) -> Result<StreamOutcome, RuntimeError> {
        let mut assistant_text = String::new();
        let mut tool_calls = Vec::new();
        let mut tool_messages = Vec::new();
        let mut had_tool_call_error = false;
        let mut message_id = None;
        let mut in_progress: Option<InProgressToolCall> = None;

        while let Some(chunk) = receiver.next_chunk().await {
            match chunk {
                RawStreamChunk::TextDelta { text } => {
                    assistant_text.push_str(&text);
                    sink(ResponseEvent::TextDelta(text));
                }
                RawStreamChunk::ReasoningDelta { text } => {
                    sink(ResponseEvent::ReasoningDelta(text));
                }
                RawStreamChunk::ToolCallStart { id, name } => {
                    in_progress = Some(InProgressToolCall {
                        id,
                        name,
                        partial_json: String::new(),
                    });
                }
                RawStreamChunk::ToolCallDelta { id, partial_json } => {
                    if let Some(current) = in_progress.as_mut() {
                        if current.id == id {
                            current.partial_json.push_str(&partial_json);
                        }
                    }
                }
                RawStreamChunk::ToolCallEnd { id } => {
                    let Some(current) = in_progress.take() else {
                        continue;
                    };
                    if current.id != id {
                        in_progress = Some(current);
                        continue;
                    }
                    let input: serde_json::Value =
                        serde_json::from_str(&current.partial_json).unwrap_or(serde_json::Value::Null);

                    let call = ToolCallRequest {
                        tool_call_id: current.id.clone(),
                        tool_name: current.name.clone(),
                        input: input.clone(),
                    };

                    // Emit the assistant tool-call message before dispatch
                    // so the `tool_call` sink event precedes `tool_result`.
                    // Gated on permission: an unpermitted call never reaches
                    // `tool_result`, so emitting `tool_call` for it would
                    // leave an orphan on the sink.
                    let call_message = Message::new(
                        Role::Assistant,
                        MessageContent::Parts(vec![ContentPart::ToolCall {
                            tool_call_id: call.tool_call_id.clone(),
                            tool_name: call.tool_name.clone(),
                            input: input.clone(),
                        }]),
                    );
                    if self.dispatcher.is_permitted(&call.tool_name) {
                        sink(ResponseEvent::ToolCall {
                            tool_call_id: call.tool_call_id.clone(),
                            tool_name: call.tool_name.clone(),
                            input: input.clone(),
                        });
                    }

                    // Sequential: this call's handler resolves before the
                    // next is started, since we're awaiting it inline
                    // within the single-threaded stream-consume loop.
                    let outcome = self.dispatcher.dispatch(&call, sink).await;
                    let (result_message, errored) = match outcome {
                        Ok(result_parts) => (
                            Message::new(Role::Tool, MessageContent::Parts(result_parts)),
                            false,
                        ),
                        Err(err) => (
                            Message::new(Role::Tool, format!("tool error: {err}")),
                            true,
                        ),
                    };
                    let mut result_message = result_message;
                    result_message.tool_call_id = Some(call.tool_call_id.clone());
                    result_message.tool_name = Some(call.tool_name.clone());

                    had_tool_call_error |= errored;
                    tool_calls.push(call);
                    tool_messages.push(call_message);
                    tool_messages.push(result_message);
                }
                RawStreamChunk::Error { message } => {
                    had_tool_call_error = true;
                    sink(ResponseEvent::Error(message));
                }
                RawStreamChunk::Finish { message_id: id } => {
                    message_id = Some(id);
                }
            }
        }

        // Second supported tool-call encoding (alongside the structured
        // stream above): `<toolName>...</toolName>` tags embedded directly
        // in assistant text. Extracted and dispatched the same way, after
        // the structured calls above, in the order they appear in the text.
        let (cleaned_text, inline_calls) = extract_inline_tool_calls(&assistant_text);
        if !inline_calls.is_empty() {
            assistant_text = cleaned_text;
            for (tool_name, input) in inline_calls {
                let call = ToolCallRequest {
                    tool_call_id: Uuid::new_v4().to_string(),
                    tool_name,
                    input: input.clone(),
                };
                let call_message = Message::new(
                    Role::Assistant,
                    MessageContent::Parts(vec![ContentPart::ToolCall {
                        tool_call_id: call.tool_call_id.clone(),
                        tool_name: call.tool_name.clone(),
                        input,
                    }]),
                );
                if self.dispatcher.is_permitted(&call.tool_name) {
                    sink(ResponseEvent::ToolCall {
                        tool_call_id: call.tool_call_id.clone(),
                        tool_name: call.tool_name.clone(),
                        input: call.input.clone(),
                    });
                }
                let outcome = self.dispatcher.dispatch(&call, sink).await;
                let (result_message, errored) = match outcome {
                    Ok(result_parts) => (
                        Message::new(Role::Tool, MessageContent::Parts(result_parts)),
                        false,
                    ),
                    Err(err) => (Message::new(Role::Tool, format!("tool error: {err}")), true),
                };
                let mut result_message = result_message;
                result_message.tool_call_id = Some(call.tool_call_id.clone());
                result_message.tool_name = Some(call.tool_name.clone());

                had_tool_call_error |= errored;
                tool_calls.push(call);
                tool_messages.push(call_message);
                tool_messages.push(result_message);
            }
        }

        Ok(StreamOutcome {
            assistant_text,
            tool_calls,
            tool_messages,
            had_tool_call_error,
            message_id,
        })
    }
}

/// Scans `text` for `<toolName>body</toolName>`-shaped tags, returning the
/// text with every matched tag removed and the ordered list of `(tag name,
/// parsed body)` calls found. A tag whose body parses as JSON is passed
/// through as structured input; otherwise the raw trimmed body is used as a
/// single string argument. Unmatched `<` (no closing tag of the same name)
/// is left in place rather than treated as a call — this runtime has no
/// other use for raw angle brackets in assistant text, so a stray `<` only
/// means the model didn't close its tag.
pub(crate) fn extract_inline_tool_calls(text: &str) -> (String, Vec<(String, serde_json::Value)>) {
    let mut remaining = text;
    let mut cleaned = String::new();
    let mut calls = Vec::new();

    while let Some(open_start) = remaining.find('<') {
        let before = &remaining[..open_start];
        let after_open = &remaining[open_start + 1..];
        let Some(tag_end) = after_open.find('>') else {
            cleaned.push_str(remaining);
            remaining = "";
            break;
        };
        let tag_name = &after_open[..tag_end];
        let is_tag_name = !tag_name.is_empty()
            && tag_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !is_tag_name {
            cleaned.push_str(before);
            cleaned.push('<');
            remaining = after_open;
            continue;
        }

        let closing_tag = format!("</{tag_name}>");
        let body_start = tag_end + 1;
        let rest = &after_open[body_start..];
        let Some(close_pos) = rest.find(&closing_tag) else {
            cleaned.push_str(before);
            cleaned.push('<');
            remaining = after_open;
            continue;
        };

        cleaned.push_str(before);
        let body = rest[..close_pos].trim();
        let input = serde_json::from_str::<serde_json::Value>(body)
            .unwrap_or_else(|_| serde_json::Value::String(body.to_string()));
        calls.push((tag_name.to_string(), input));
        remaining = &rest[close_pos + closing_tag.len()..];
    }
    cleaned.push_str(remaining);
    (cleaned, calls)
}

#[cfg(test)]
mod inline_tool_call_tests {
    use super::*;

    #[test]
    fn extracts_json_bodied_tag() {
        let (text, calls) = extract_inline_tool_calls(r#"Sure, let me check. <search>{"query":"weather"}</search> one sec."#);
        assert_eq!(text, "Sure, let me check.  one sec.");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "search");
        assert_eq!(calls[0].1, serde_json::json!({"query": "weather"}));
    }

    #[test]
    fn plain_text_body_becomes_string_input() {
        let (_, calls) = extract_inline_tool_calls("<think>considering options</think>");
        assert_eq!(calls[0].1, serde_json::Value::String("considering options".to_string()));
    }

    #[test]
    fn unmatched_angle_bracket_is_left_untouched() {
        let (text, calls) = extract_inline_tool_calls("a < b and <search>x</search>");
        assert!(calls.len() == 1 && calls[0].0 == "search");
        assert!(text.starts_with("a < b and"));
    }
}

//! Pi coding agent `--mode json` adapter.
//!
//! Streaming text and thinking come through `message_update` events whose
//! `assistantMessageEvent` holds the actual delta or block end. Tool activity
//! is reported by dedicated `tool_execution_*` events. `agent_end` closes the
//! run and lists every message; the last assistant message is the result.

use serde::Deserialize;
use serde_json::Value;

use super::{MessageRole, StreamEvent, StreamParser, ToolStatus, decode, non_empty, value_text};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PiLine {
    Session {
        #[serde(default)]
        id: Option<String>,
    },
    AgentStart {},
    #[serde(rename_all = "camelCase")]
    MessageUpdate {
        #[serde(default)]
        assistant_message_event: Option<AssistantEvent>,
    },
    #[serde(rename_all = "camelCase")]
    ToolExecutionStart {
        #[serde(default)]
        tool_call_id: Option<String>,
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolExecutionEnd {
        #[serde(default)]
        tool_call_id: Option<String>,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        is_error: bool,
    },
    AgentEnd {
        #[serde(default)]
        messages: Vec<Value>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AssistantEvent {
    TextDelta {
        #[serde(default)]
        delta: String,
    },
    TextEnd {
        #[serde(default)]
        content: String,
    },
    ThinkingDelta {
        #[serde(default)]
        delta: String,
    },
    ThinkingEnd {
        #[serde(default)]
        content: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default)]
pub(super) struct PiParser {
    session_seen: bool,
    last_text: Option<String>,
}

impl StreamParser for PiParser {
    fn parse_line(&mut self, raw: &str) -> Option<StreamEvent> {
        match decode::<PiLine>(raw)? {
            PiLine::Session { id } => {
                self.session_seen = true;
                Some(StreamEvent::Init {
                    session_id: id,
                    model: None,
                })
            }
            // `agent_start` only stands in for init when no session header came first.
            PiLine::AgentStart {} => (!std::mem::replace(&mut self.session_seen, true)).then_some(
                StreamEvent::Init {
                    session_id: None,
                    model: None,
                },
            ),
            PiLine::MessageUpdate {
                assistant_message_event,
            } => self.message_event(assistant_message_event?),
            PiLine::ToolExecutionStart {
                tool_call_id,
                tool_name,
                args,
            } => Some(StreamEvent::ToolCall {
                id: tool_call_id,
                name: tool_name,
                parameters: args,
            }),
            PiLine::ToolExecutionEnd {
                tool_call_id,
                result,
                is_error,
            } => Some(StreamEvent::ToolResult {
                id: tool_call_id,
                status: if is_error {
                    ToolStatus::Error
                } else {
                    ToolStatus::Success
                },
                output: value_text(&result),
            }),
            PiLine::AgentEnd { messages } => Some(StreamEvent::Terminal {
                final_text: last_assistant_text(&messages).or_else(|| self.last_text.take()),
            }),
            PiLine::Unknown => None,
        }
    }
}

impl PiParser {
    fn message_event(&mut self, event: AssistantEvent) -> Option<StreamEvent> {
        let (role, content, is_delta) = match event {
            AssistantEvent::TextDelta { delta } => (MessageRole::Assistant, delta, true),
            AssistantEvent::TextEnd { content } => {
                self.last_text = non_empty(content.clone());
                (MessageRole::Assistant, content, false)
            }
            AssistantEvent::ThinkingDelta { delta } => (MessageRole::Thinking, delta, true),
            AssistantEvent::ThinkingEnd { content } => (MessageRole::Thinking, content, false),
            AssistantEvent::Other => return None,
        };
        Some(StreamEvent::Message {
            role,
            content,
            is_delta,
        })
    }
}

/// Text blocks of the last assistant message in an `agent_end` message list.
fn last_assistant_text(messages: &[Value]) -> Option<String> {
    let message = messages
        .iter()
        .rev()
        .find(|message| message.get("role").and_then(Value::as_str) == Some("assistant"))?;
    let text = match message.get("content")? {
        Value::Array(blocks) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::String(text) => text.clone(),
        _ => return None,
    };
    non_empty(text)
}

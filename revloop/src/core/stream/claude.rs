//! Claude Code `--output-format stream-json` adapter.
//!
//! With `--include-partial-messages` the CLI emits
//! `system -> stream_event* -> assistant -> ... -> result`. Text and thinking
//! arrive as `stream_event` deltas; the following `assistant` event repeats the
//! finished block and is mapped to a non-delta message so the display buffer
//! can close the block. Without partial messages only the `assistant` events
//! carry text.

use serde::Deserialize;
use serde_json::Value;

use super::{MessageRole, StreamEvent, StreamParser, ToolStatus, decode, non_empty, value_text};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeLine {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    StreamEvent {
        #[serde(default)]
        event: Option<InnerEvent>,
    },
    Assistant {
        #[serde(default)]
        message: Option<Message>,
    },
    User {
        #[serde(default)]
        message: Option<Message>,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InnerEvent {
    ContentBlockDelta { delta: Delta },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Content,
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum Content {
    Blocks(Vec<Block>),
    Text(String),
    #[default]
    Empty,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default)]
pub(super) struct ClaudeParser;

impl StreamParser for ClaudeParser {
    fn parse_line(&mut self, raw: &str) -> Option<StreamEvent> {
        let mut events = self.parse_line_events(raw);
        let tool_call = events
            .iter()
            .position(|event| matches!(event, StreamEvent::ToolCall { .. }));
        match tool_call {
            Some(idx) => Some(events.swap_remove(idx)),
            None => events.into_iter().next(),
        }
    }

    fn parse_line_events(&mut self, raw: &str) -> Vec<StreamEvent> {
        decode::<ClaudeLine>(raw).map(line_events).unwrap_or_default()
    }
}

fn line_events(line: ClaudeLine) -> Vec<StreamEvent> {
    let event = match line {
        ClaudeLine::Assistant { message } => {
            return message.map(|m| assistant_events(m.content)).unwrap_or_default();
        }
        ClaudeLine::System {
            subtype,
            session_id,
            model,
        } => (subtype.as_deref() == Some("init")).then_some(StreamEvent::Init { session_id, model }),
        ClaudeLine::StreamEvent { event } => event.and_then(inner_event),
        ClaudeLine::User { message } => message.and_then(|m| user_event(m.content)),
        ClaudeLine::Result { result } => Some(StreamEvent::Terminal {
            final_text: result.and_then(non_empty),
        }),
        ClaudeLine::Unknown => None,
    };
    event.into_iter().collect()
}

fn inner_event(event: InnerEvent) -> Option<StreamEvent> {
    match event {
        InnerEvent::ContentBlockDelta { delta } => match delta {
            Delta::TextDelta { text } => Some(delta_message(MessageRole::Assistant, text)),
            Delta::ThinkingDelta { thinking } => Some(delta_message(MessageRole::Thinking, thinking)),
            Delta::Other => None,
        },
        InnerEvent::Other => None,
    }
}

fn delta_message(role: MessageRole, content: String) -> StreamEvent {
    StreamEvent::Message {
        role,
        content,
        is_delta: true,
    }
}

/// The message (text over thinking) followed by any tool calls.
fn assistant_events(content: Content) -> Vec<StreamEvent> {
    let blocks = match content {
        Content::Blocks(blocks) => blocks,
        Content::Text(text) => {
            return vec![StreamEvent::Message {
                role: MessageRole::Assistant,
                content: text,
                is_delta: false,
            }];
        }
        Content::Empty => return Vec::new(),
    };

    let mut text = Vec::new();
    let mut thinking = Vec::new();
    let mut calls = Vec::new();
    for block in blocks {
        match block {
            Block::ToolUse { id, name, input } => calls.push(StreamEvent::ToolCall {
                id,
                name,
                parameters: input,
            }),
            Block::Text { text: t } => text.push(t),
            Block::Thinking { thinking: t } => thinking.push(t),
            Block::ToolResult { .. } | Block::Other => {}
        }
    }

    let message = if !text.is_empty() {
        Some((MessageRole::Assistant, text))
    } else if !thinking.is_empty() {
        Some((MessageRole::Thinking, thinking))
    } else {
        None
    };
    let mut events: Vec<StreamEvent> = message
        .map(|(role, parts)| StreamEvent::Message {
            role,
            content: parts.join("\n"),
            is_delta: false,
        })
        .into_iter()
        .collect();
    events.extend(calls);
    events
}

fn user_event(content: Content) -> Option<StreamEvent> {
    match content {
        Content::Blocks(blocks) => blocks.into_iter().find_map(|block| match block {
            Block::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(StreamEvent::ToolResult {
                id: tool_use_id,
                status: if is_error {
                    ToolStatus::Error
                } else {
                    ToolStatus::Success
                },
                output: value_text(&content),
            }),
            _ => None,
        }),
        Content::Text(text) => Some(StreamEvent::Message {
            role: MessageRole::User,
            content: text,
            is_delta: false,
        }),
        Content::Empty => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(line: &str) -> Option<StreamEvent> {
        ClaudeParser.parse_line(line)
    }

    #[test]
    fn init_and_result() {
        assert_eq!(
            parse(r#"{"type":"system","subtype":"init","session_id":"abc","model":"claude-sonnet-4-5","tools":[]}"#),
            Some(StreamEvent::Init {
                session_id: Some("abc".to_string()),
                model: Some("claude-sonnet-4-5".to_string()),
            })
        );
        assert_eq!(parse(r#"{"type":"system","subtype":"hook_response"}"#), None);
        assert_eq!(
            parse(r#"{"type":"result","subtype":"success","is_error":false,"result":"done","num_turns":3}"#),
            Some(StreamEvent::Terminal {
                final_text: Some("done".to_string())
            })
        );
    }

    #[test]
    fn stream_event_deltas() {
        assert_eq!(
            parse(r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}}"#),
            Some(delta_message(MessageRole::Assistant, "Hel".to_string()))
        );
        assert_eq!(
            parse(r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hm"}}}"#),
            Some(delta_message(MessageRole::Thinking, "hm".to_string()))
        );
        assert_eq!(
            parse(r#"{"type":"stream_event","event":{"type":"content_block_stop","index":0}}"#),
            None
        );
        assert_eq!(
            parse(r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{"}}}"#),
            None
        );
    }

    #[test]
    fn assistant_blocks() {
        assert_eq!(
            parse(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Looking now."}]}}"#),
            Some(StreamEvent::Message {
                role: MessageRole::Assistant,
                content: "Looking now.".to_string(),
                is_delta: false,
            })
        );
        assert_eq!(
            parse(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"x"},{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"ls"}}]}}"#),
            Some(StreamEvent::ToolCall {
                id: Some("toolu_1".to_string()),
                name: "Bash".to_string(),
                parameters: json!({"command": "ls"}),
            })
        );
        assert_eq!(
            parse(r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"plan","signature":"s"}]}}"#),
            Some(StreamEvent::Message {
                role: MessageRole::Thinking,
                content: "plan".to_string(),
                is_delta: false,
            })
        );
    }

    #[test]
    fn text_and_tool_use_on_one_line_yield_both_in_order() {
        let events = ClaudeParser.parse_line_events(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Listing files."},{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"ls"}}]}}"#,
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Message {
                    role: MessageRole::Assistant,
                    content: "Listing files.".to_string(),
                    is_delta: false,
                },
                StreamEvent::ToolCall {
                    id: Some("toolu_1".to_string()),
                    name: "Bash".to_string(),
                    parameters: json!({"command": "ls"}),
                },
            ]
        );
    }

    #[test]
    fn user_tool_results_accept_string_and_block_content() {
        assert_eq!(
            parse(r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"a\nb","is_error":false}]}}"#),
            Some(StreamEvent::ToolResult {
                id: Some("toolu_1".to_string()),
                status: ToolStatus::Success,
                output: "a\nb".to_string(),
            })
        );
        assert_eq!(
            parse(r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_2","content":[{"type":"text","text":"denied"}],"is_error":true}]}}"#),
            Some(StreamEvent::ToolResult {
                id: Some("toolu_2".to_string()),
                status: ToolStatus::Error,
                output: "denied".to_string(),
            })
        );
    }
}

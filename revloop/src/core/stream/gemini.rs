//! Gemini CLI `--output-format stream-json` adapter.
//!
//! The closing `result` event carries only status and stats, so assistant
//! text is accumulated here and reported as the final text.

use serde::Deserialize;
use serde_json::Value;

use super::{MessageRole, StreamEvent, StreamParser, ToolStatus, decode, non_empty, value_text};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GeminiLine {
    Init {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Message {
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        content: String,
        #[serde(default)]
        delta: bool,
    },
    ToolUse {
        tool_name: String,
        #[serde(default)]
        tool_id: Option<String>,
        #[serde(default)]
        parameters: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_id: Option<String>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        output: Value,
        #[serde(default)]
        error: Value,
    },
    Result {},
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default)]
pub(super) struct GeminiParser {
    assistant_text: String,
}

impl StreamParser for GeminiParser {
    fn parse_line(&mut self, raw: &str) -> Option<StreamEvent> {
        match decode::<GeminiLine>(raw)? {
            GeminiLine::Init { session_id, model } => Some(StreamEvent::Init { session_id, model }),
            GeminiLine::Message {
                role,
                content,
                delta,
            } => {
                let role = match role.as_deref() {
                    Some("assistant") => {
                        if !delta && !self.assistant_text.is_empty() {
                            self.assistant_text.push('\n');
                        }
                        self.assistant_text.push_str(&content);
                        MessageRole::Assistant
                    }
                    Some("user") => MessageRole::User,
                    _ => return None,
                };
                Some(StreamEvent::Message {
                    role,
                    content,
                    is_delta: delta,
                })
            }
            GeminiLine::ToolUse {
                tool_name,
                tool_id,
                parameters,
            } => Some(StreamEvent::ToolCall {
                id: tool_id,
                name: tool_name,
                parameters,
            }),
            GeminiLine::ToolResult {
                tool_id,
                status,
                output,
                error,
            } => {
                let failed = status.as_deref() == Some("error") || !error.is_null();
                Some(StreamEvent::ToolResult {
                    id: tool_id,
                    status: if failed {
                        ToolStatus::Error
                    } else {
                        ToolStatus::Success
                    },
                    output: if failed && output.is_null() {
                        value_text(&error)
                    } else {
                        value_text(&output)
                    },
                })
            }
            GeminiLine::Result {} => Some(StreamEvent::Terminal {
                final_text: non_empty(std::mem::take(&mut self.assistant_text)),
            }),
            GeminiLine::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_deltas_into_final_text() {
        let mut parser = GeminiParser::default();
        let lines = [
            r#"{"type":"init","timestamp":"t","session_id":"g-1","model":"gemini-2.5-pro"}"#,
            r#"{"type":"message","role":"user","content":"review","timestamp":"t"}"#,
            r#"{"type":"message","role":"assistant","content":"No issues ","delta":true}"#,
            r#"{"type":"message","role":"assistant","content":"found.","delta":true}"#,
            r#"{"type":"result","status":"success","stats":{"total_tokens":10}}"#,
        ];
        let events: Vec<StreamEvent> = lines
            .iter()
            .filter_map(|line| parser.parse_line(line))
            .collect();
        assert_eq!(events.len(), 5);
        assert_eq!(
            events[2],
            StreamEvent::Message {
                role: MessageRole::Assistant,
                content: "No issues ".to_string(),
                is_delta: true,
            }
        );
        assert_eq!(
            events[4],
            StreamEvent::Terminal {
                final_text: Some("No issues found.".to_string())
            }
        );
    }

    #[test]
    fn tool_error_uses_error_message() {
        let mut parser = GeminiParser::default();
        assert_eq!(
            parser.parse_line(r#"{"type":"tool_result","tool_id":"run_1","status":"error","error":{"type":"exit","message":"command failed"}}"#),
            Some(StreamEvent::ToolResult {
                id: Some("run_1".to_string()),
                status: ToolStatus::Error,
                output: "command failed".to_string(),
            })
        );
    }

    #[test]
    fn result_without_assistant_text_has_no_final_text() {
        let mut parser = GeminiParser::default();
        assert_eq!(
            parser.parse_line(r#"{"type":"result","status":"error"}"#),
            Some(StreamEvent::Terminal { final_text: None })
        );
    }
}

//! Factory Droid `exec --output-format stream-json` adapter.

use serde::Deserialize;
use serde_json::Value;

use super::{MessageRole, StreamEvent, StreamParser, ToolStatus, decode, non_empty, value_text};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DroidLine {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Message {
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        text: String,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        #[serde(default)]
        id: Option<String>,
        tool_name: String,
        #[serde(default)]
        parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        tool_id: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        value: Value,
    },
    #[serde(rename_all = "camelCase")]
    Completion {
        #[serde(default)]
        final_text: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default)]
pub(super) struct DroidParser {
    last_assistant: Option<String>,
}

impl StreamParser for DroidParser {
    fn parse_line(&mut self, raw: &str) -> Option<StreamEvent> {
        match decode::<DroidLine>(raw)? {
            DroidLine::System {
                subtype,
                session_id,
                model,
            } => (subtype.as_deref() == Some("init"))
                .then_some(StreamEvent::Init { session_id, model }),
            DroidLine::Message { role, text } => {
                let role = match role.as_deref() {
                    Some("assistant") => {
                        self.last_assistant = non_empty(text.clone());
                        MessageRole::Assistant
                    }
                    Some("user") => MessageRole::User,
                    _ => return None,
                };
                Some(StreamEvent::Message {
                    role,
                    content: text,
                    is_delta: false,
                })
            }
            DroidLine::Reasoning { text } => Some(StreamEvent::Message {
                role: MessageRole::Thinking,
                content: text,
                is_delta: false,
            }),
            DroidLine::ToolCall {
                id,
                tool_name,
                parameters,
            } => Some(StreamEvent::ToolCall {
                id,
                name: tool_name,
                parameters,
            }),
            DroidLine::ToolResult {
                id,
                tool_id,
                is_error,
                value,
            } => Some(StreamEvent::ToolResult {
                id: id.or(tool_id),
                status: if is_error {
                    ToolStatus::Error
                } else {
                    ToolStatus::Success
                },
                output: value_text(&value),
            }),
            DroidLine::Completion { final_text } => Some(StreamEvent::Terminal {
                final_text: final_text
                    .and_then(non_empty)
                    .or_else(|| self.last_assistant.take()),
            }),
            DroidLine::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_droid_session() {
        let mut parser = DroidParser::default();
        let lines = [
            r#"{"type":"system","subtype":"init","cwd":"/repo","session_id":"s-1","tools":[],"model":"glm-4.6"}"#,
            r#"{"type":"message","role":"user","id":"m0","text":"review this","timestamp":1}"#,
            r#"{"type":"tool_call","id":"c1","messageId":"m1","toolId":"Read","toolName":"Read","parameters":{"file_path":"a.rs"}}"#,
            r#"{"type":"tool_result","id":"c1","messageId":"m2","toolId":"Read","isError":false,"value":"1| fn a() {}"}"#,
            r#"{"type":"message","role":"assistant","id":"m3","text":"All clear."}"#,
            r#"{"type":"completion","finalText":"All clear.","numTurns":2,"durationMs":900}"#,
        ];
        let events: Vec<StreamEvent> = lines
            .iter()
            .filter_map(|line| parser.parse_line(line))
            .collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::Init {
                    session_id: Some("s-1".to_string()),
                    model: Some("glm-4.6".to_string()),
                },
                StreamEvent::Message {
                    role: MessageRole::User,
                    content: "review this".to_string(),
                    is_delta: false,
                },
                StreamEvent::ToolCall {
                    id: Some("c1".to_string()),
                    name: "Read".to_string(),
                    parameters: json!({"file_path": "a.rs"}),
                },
                StreamEvent::ToolResult {
                    id: Some("c1".to_string()),
                    status: ToolStatus::Success,
                    output: "1| fn a() {}".to_string(),
                },
                StreamEvent::Message {
                    role: MessageRole::Assistant,
                    content: "All clear.".to_string(),
                    is_delta: false,
                },
                StreamEvent::Terminal {
                    final_text: Some("All clear.".to_string()),
                },
            ]
        );
    }

    #[test]
    fn completion_without_text_falls_back_to_last_assistant_message() {
        let mut parser = DroidParser::default();
        parser.parse_line(r#"{"type":"message","role":"assistant","text":"summary here"}"#);
        assert_eq!(
            parser.parse_line(r#"{"type":"completion","finalText":""}"#),
            Some(StreamEvent::Terminal {
                final_text: Some("summary here".to_string())
            })
        );
    }

    #[test]
    fn error_results_are_flagged() {
        let mut parser = DroidParser::default();
        assert_eq!(
            parser.parse_line(r#"{"type":"tool_result","toolId":"Execute","isError":true,"value":{"error":"exit 1","output":"boom"}}"#),
            Some(StreamEvent::ToolResult {
                id: Some("Execute".to_string()),
                status: ToolStatus::Error,
                output: "boom".to_string(),
            })
        );
    }
}

//! Codex `exec --json` adapter.
//!
//! Codex reports work as items that move through `item.started`,
//! `item.updated` and `item.completed`. Messages are only complete on
//! `item.completed`; commands are announced on start and reported on
//! completion. A turn ends with `turn.completed` (or `turn.failed`), which
//! carries no text, so the last agent message is remembered here.

use serde::Deserialize;
use serde_json::{Value, json};

use super::{MessageRole, StreamEvent, StreamParser, ToolStatus, decode, non_empty, value_text};

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum CodexLine {
    #[serde(rename = "thread.started")]
    ThreadStarted {
        #[serde(default)]
        thread_id: Option<String>,
    },
    #[serde(rename = "item.started")]
    ItemStarted { item: Item },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: Item },
    #[serde(rename = "turn.completed")]
    TurnCompleted {},
    #[serde(rename = "turn.failed")]
    TurnFailed {},
    #[serde(rename = "error")]
    Error {},
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Item {
    AgentMessage {
        #[serde(default)]
        text: String,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    CommandExecution {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        command: String,
        #[serde(default)]
        aggregated_output: String,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        status: Option<String>,
    },
    McpToolCall {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        server: Option<String>,
        tool: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Value,
    },
    FileChange {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        changes: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default)]
pub(super) struct CodexParser {
    last_message: Option<String>,
}

impl StreamParser for CodexParser {
    fn parse_line(&mut self, raw: &str) -> Option<StreamEvent> {
        match decode::<CodexLine>(raw)? {
            CodexLine::ThreadStarted { thread_id } => Some(StreamEvent::Init {
                session_id: thread_id,
                model: None,
            }),
            CodexLine::ItemStarted { item } => started(item),
            CodexLine::ItemCompleted { item } => self.completed(item),
            CodexLine::TurnCompleted {} => Some(StreamEvent::Terminal {
                final_text: self.last_message.take(),
            }),
            CodexLine::TurnFailed {} | CodexLine::Error {} => {
                Some(StreamEvent::Terminal { final_text: None })
            }
            CodexLine::Unknown => None,
        }
    }
}

fn started(item: Item) -> Option<StreamEvent> {
    match item {
        Item::CommandExecution { id, command, .. } => Some(StreamEvent::ToolCall {
            id,
            name: "shell".to_string(),
            parameters: json!({ "command": command }),
        }),
        Item::McpToolCall {
            id,
            server,
            tool,
            arguments,
            ..
        } => Some(StreamEvent::ToolCall {
            id,
            name: qualified_tool(server.as_deref(), &tool),
            parameters: arguments,
        }),
        _ => None,
    }
}

impl CodexParser {
    fn completed(&mut self, item: Item) -> Option<StreamEvent> {
        match item {
            Item::AgentMessage { text } => {
                self.last_message = non_empty(text.clone());
                Some(StreamEvent::Message {
                    role: MessageRole::Assistant,
                    content: text,
                    is_delta: false,
                })
            }
            Item::Reasoning { text } => Some(StreamEvent::Message {
                role: MessageRole::Thinking,
                content: text,
                is_delta: false,
            }),
            Item::CommandExecution {
                id,
                aggregated_output,
                exit_code,
                status,
                ..
            } => {
                let failed = status.as_deref() == Some("failed") || exit_code.is_some_and(|c| c != 0);
                Some(StreamEvent::ToolResult {
                    id,
                    status: if failed {
                        ToolStatus::Error
                    } else {
                        ToolStatus::Success
                    },
                    output: aggregated_output,
                })
            }
            Item::McpToolCall {
                id, result, error, ..
            } => {
                let (status, output) = if error.is_null() {
                    (ToolStatus::Success, value_text(&result))
                } else {
                    (ToolStatus::Error, value_text(&error))
                };
                Some(StreamEvent::ToolResult { id, status, output })
            }
            Item::FileChange { id, changes } => Some(StreamEvent::ToolCall {
                id,
                name: "apply_patch".to_string(),
                parameters: changes,
            }),
            Item::Other => None,
        }
    }
}

fn qualified_tool(server: Option<&str>, tool: &str) -> String {
    match server {
        Some(server) if !server.is_empty() => format!("{server}.{tool}"),
        _ => tool.to_string(),
    }
}

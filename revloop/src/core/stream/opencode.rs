//! OpenCode `run --format json` adapter.
//!
//! Every line wraps a message `part`. Text parts arrive complete, tool parts
//! carry their lifecycle in `part.state`, and a `step_finish` whose reason is
//! `stop` ends the run. The final text is the text of the last step.

use serde::Deserialize;
use serde_json::Value;

use super::{MessageRole, StreamEvent, StreamParser, ToolStatus, decode, non_empty, value_text};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpencodeLine {
    StepStart {
        #[serde(default, rename = "sessionID")]
        session_id: Option<String>,
    },
    Text {
        part: TextPart,
    },
    Reasoning {
        part: TextPart,
    },
    ToolUse {
        part: ToolPart,
    },
    StepFinish {
        #[serde(default)]
        part: Option<FinishPart>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct TextPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ToolPart {
    #[serde(default, rename = "callID")]
    call_id: Option<String>,
    tool: String,
    #[serde(default)]
    state: ToolState,
}

#[derive(Debug, Default, Deserialize)]
struct ToolState {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Value,
}

#[derive(Debug, Deserialize)]
struct FinishPart {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default)]
pub(super) struct OpencodeParser {
    started: bool,
    step_text: String,
}

impl StreamParser for OpencodeParser {
    fn parse_line(&mut self, raw: &str) -> Option<StreamEvent> {
        match decode::<OpencodeLine>(raw)? {
            OpencodeLine::StepStart { session_id } => {
                self.step_text.clear();
                if self.started {
                    return None;
                }
                self.started = true;
                Some(StreamEvent::Init {
                    session_id,
                    model: None,
                })
            }
            OpencodeLine::Text { part } => {
                if !self.step_text.is_empty() {
                    self.step_text.push('\n');
                }
                self.step_text.push_str(&part.text);
                Some(StreamEvent::Message {
                    role: MessageRole::Assistant,
                    content: part.text,
                    is_delta: false,
                })
            }
            OpencodeLine::Reasoning { part } => Some(StreamEvent::Message {
                role: MessageRole::Thinking,
                content: part.text,
                is_delta: false,
            }),
            OpencodeLine::ToolUse { part } => Some(tool_event(part)),
            OpencodeLine::StepFinish { part } => {
                let reason = part.and_then(|p| p.reason);
                (reason.as_deref() == Some("stop")).then(|| StreamEvent::Terminal {
                    final_text: non_empty(std::mem::take(&mut self.step_text)),
                })
            }
            OpencodeLine::Unknown => None,
        }
    }
}

/// Completed and errored tool parts become results; anything still pending
/// or running is reported as the call itself.
fn tool_event(part: ToolPart) -> StreamEvent {
    let ToolPart {
        call_id,
        tool,
        state,
    } = part;
    match state.status.as_deref() {
        Some("completed") => StreamEvent::ToolResult {
            id: call_id,
            status: ToolStatus::Success,
            output: value_text(&state.output),
        },
        Some("error") => StreamEvent::ToolResult {
            id: call_id,
            status: ToolStatus::Error,
            output: value_text(&state.error),
        },
        _ => StreamEvent::ToolCall {
            id: call_id,
            name: tool,
            parameters: state.input,
        },
    }
}

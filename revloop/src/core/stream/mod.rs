//! Canonical event model for agent transcripts.
//!
//! Every supported agent CLI prints newline-delimited JSON in its own dialect.
//! Each dialect has an adapter implementing [`StreamParser`] that maps one raw
//! line to its primary [`StreamEvent`], or to every event on the line for
//! display. Lines that are not JSON, fail to decode, or carry an event type
//! the adapter does not care about are dropped.
//!
//! Downstream consumers (display, result extraction) only ever see
//! [`StreamEvent`], so adding an agent means adding an adapter and a match arm
//! in [`parser_for`].

mod claude;
mod codex;
mod display;
mod droid;
mod gemini;
mod opencode;
mod pi;
mod render;

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::types::AgentKind;

pub use display::{DeltaBuffer, DisplayChunk, MAX_CHUNK_CHARS};
pub use render::{StreamRenderer, render_transcript};

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    Thinking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Success,
    Error,
}

/// One normalized transcript event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Init {
        session_id: Option<String>,
        model: Option<String>,
    },
    /// Text from a participant. `is_delta` marks an incremental fragment; a
    /// non-delta message either stands alone or closes a streamed block with
    /// its full content.
    Message {
        role: MessageRole,
        content: String,
        is_delta: bool,
    },
    ToolCall {
        id: Option<String>,
        name: String,
        parameters: Value,
    },
    ToolResult {
        id: Option<String>,
        status: ToolStatus,
        output: String,
    },
    /// End of the agent's run. `final_text` is the agent's last answer when the
    /// protocol reports one or the adapter accumulated it.
    Terminal { final_text: Option<String> },
}

/// Maps raw transcript lines to canonical events.
pub trait StreamParser: Send {
    /// The line's primary event. A line carrying a tool call reports the call.
    fn parse_line(&mut self, raw: &str) -> Option<StreamEvent>;

    /// Every event on the line, in order. Display uses this so text sharing a
    /// line with a tool call is not lost.
    fn parse_line_events(&mut self, raw: &str) -> Vec<StreamEvent> {
        self.parse_line(raw).into_iter().collect()
    }
}

/// Fresh parser for the given agent's protocol.
pub fn parser_for(kind: AgentKind) -> Box<dyn StreamParser> {
    match kind {
        AgentKind::Claude => Box::new(claude::ClaudeParser::default()),
        AgentKind::Codex => Box::new(codex::CodexParser::default()),
        AgentKind::Droid => Box::new(droid::DroidParser::default()),
        AgentKind::Gemini => Box::new(gemini::GeminiParser::default()),
        AgentKind::Opencode => Box::new(opencode::OpencodeParser::default()),
        AgentKind::Pi => Box::new(pi::PiParser::default()),
    }
}

/// Final text of the last terminal event, if the transcript has one with text.
pub fn extract_result(kind: AgentKind, transcript: &str) -> Option<String> {
    let mut parser = parser_for(kind);
    let mut result = None;
    let mut saw_terminal = false;
    for line in transcript.lines() {
        if let Some(StreamEvent::Terminal { final_text }) = parser.parse_line(line) {
            saw_terminal = true;
            result = final_text;
        }
    }
    if !saw_terminal {
        return None;
    }
    result.filter(|text| !text.trim().is_empty())
}

const MAX_TOOL_PARAMS_CHARS: usize = 200;
const MAX_TOOL_OUTPUT_LINES: usize = 12;

/// Human-readable rendering of a single event. `None` for events with nothing
/// to show (init, user echo, empty output).
pub fn format_for_display(event: &StreamEvent) -> Option<String> {
    match event {
        StreamEvent::Init { .. } => None,
        StreamEvent::Message { role, content, .. } => {
            if content.trim().is_empty() {
                return None;
            }
            match role {
                MessageRole::Assistant => Some(content.clone()),
                MessageRole::Thinking => Some(format!("Thinking: {content}")),
                MessageRole::User => None,
            }
        }
        StreamEvent::ToolCall {
            name, parameters, ..
        } => {
            let params = compact_params(parameters);
            if params.is_empty() {
                Some(format!("Tool: {name}"))
            } else {
                Some(format!("Tool: {name} {params}"))
            }
        }
        StreamEvent::ToolResult { status, output, .. } => {
            let cleaned = strip_system_reminders(output);
            let shown = clip_lines(cleaned.trim(), MAX_TOOL_OUTPUT_LINES);
            let label = match status {
                ToolStatus::Success => "Output",
                ToolStatus::Error => "Output (error)",
            };
            if shown.is_empty() {
                Some(format!("{label}: (empty)"))
            } else {
                Some(format!("{label}: {shown}"))
            }
        }
        StreamEvent::Terminal { final_text } => final_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .map(|text| format!("Result: {text}")),
    }
}

static REMINDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<system-reminder>.*?(?:</system-reminder>|\z)").expect("valid reminder regex")
});

/// Remove `<system-reminder>` spans. An unterminated span runs to the end.
pub fn strip_system_reminders(text: &str) -> String {
    REMINDER_RE.replace_all(text, "").into_owned()
}

fn compact_params(parameters: &Value) -> String {
    match parameters {
        Value::Null => String::new(),
        Value::Object(map) if map.is_empty() => String::new(),
        other => clip_chars(&other.to_string(), MAX_TOOL_PARAMS_CHARS),
    }
}

fn clip_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn clip_lines(text: &str, max: usize) -> String {
    let total = text.lines().count();
    if total <= max {
        return text.to_string();
    }
    let kept: Vec<&str> = text.lines().take(max).collect();
    format!("{}\n... ({} more lines)", kept.join("\n"), total - max)
}

/// Decode one JSON object line; anything else is `None`.
fn decode<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Flatten a tool output payload to text. Handles plain strings, arrays of
/// content blocks (`{"type":"text","text":...}`) and wrapper objects.
fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(value_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => ["text", "content", "output", "message"]
            .iter()
            .find_map(|key| map.get(*key))
            .map(value_text)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

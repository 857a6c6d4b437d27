//! Live rendering of an agent's stdout for the operator.

use super::{
    DeltaBuffer, DisplayChunk, MessageRole, StreamEvent, StreamParser, format_for_display,
    parser_for,
};
use crate::core::types::AgentKind;

/// Turns raw stdout lines into display lines.
pub struct StreamRenderer {
    parser: Box<dyn StreamParser>,
    buffer: DeltaBuffer,
}

impl StreamRenderer {
    pub fn new(kind: AgentKind) -> Self {
        Self {
            parser: parser_for(kind),
            buffer: DeltaBuffer::new(),
        }
    }

    /// Feed one raw line; returns zero or more display lines.
    pub fn push_line(&mut self, raw: &str) -> Vec<String> {
        self.parser
            .parse_line_events(raw)
            .into_iter()
            .flat_map(|event| self.push_event(event))
            .collect()
    }

    fn push_event(&mut self, event: StreamEvent) -> Vec<String> {
        match event {
            StreamEvent::Message {
                role,
                content,
                is_delta: true,
            } => render_chunks(self.buffer.push_delta(role, &content)),
            StreamEvent::Message {
                role,
                content,
                is_delta: false,
            } => render_chunks(self.buffer.end_block(role, &content)),
            other => {
                let mut lines = render_chunks(self.buffer.finish());
                lines.extend(format_for_display(&other));
                lines
            }
        }
    }

    /// Flush anything still buffered at end of stream.
    pub fn finish(&mut self) -> Vec<String> {
        render_chunks(self.buffer.finish())
    }
}

/// Render a whole saved transcript.
pub fn render_transcript(kind: AgentKind, transcript: &str) -> Vec<String> {
    let mut renderer = StreamRenderer::new(kind);
    let mut lines: Vec<String> = transcript
        .lines()
        .flat_map(|line| renderer.push_line(line))
        .collect();
    lines.extend(renderer.finish());
    lines
}

fn render_chunks(chunks: impl IntoIterator<Item = DisplayChunk>) -> Vec<String> {
    chunks
        .into_iter()
        .filter_map(|chunk| match chunk.role {
            MessageRole::User => None,
            MessageRole::Thinking if chunk.starts_block => Some(format!("Thinking: {}", chunk.text)),
            MessageRole::Thinking | MessageRole::Assistant => Some(chunk.text),
        })
        .collect()
}

//! Display buffering for streamed message deltas.
//!
//! Agents stream text in arbitrary fragments (sometimes a few characters at a
//! time). Printing each fragment as its own line is unreadable, so deltas are
//! held until a natural break and emitted as one chunk.
//!
//! Flush points:
//! - end of block (a non-delta message, a role switch, or any non-message event);
//! - a sentence boundary (`. ` `! ` `? `), flushing through the boundary;
//! - a paragraph boundary (`\n\n`);
//! - the buffer growing past [`MAX_CHUNK_CHARS`], flushing exactly that many
//!   characters even mid-word;
//! - the terminal event.
//!
//! Concatenating all chunks of a block reproduces the concatenated deltas.

use super::MessageRole;

/// Longest chunk emitted while no boundary has been seen.
pub const MAX_CHUNK_CHARS: usize = 400;

const BOUNDARIES: [&str; 4] = [". ", "! ", "? ", "\n\n"];

/// A flushed piece of buffered text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayChunk {
    pub role: MessageRole,
    pub text: String,
    /// First chunk of its block; renderers attach the role label here.
    pub starts_block: bool,
}

#[derive(Debug)]
pub struct DeltaBuffer {
    pending: String,
    role: Option<MessageRole>,
    /// Any delta arrived for the current block.
    streamed: bool,
    /// A chunk of the current block was already emitted.
    emitted: bool,
    max_chars: usize,
}

impl Default for DeltaBuffer {
    fn default() -> Self {
        Self::with_max_chars(MAX_CHUNK_CHARS)
    }
}

impl DeltaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_chars(max_chars: usize) -> Self {
        Self {
            pending: String::new(),
            role: None,
            streamed: false,
            emitted: false,
            max_chars: max_chars.max(1),
        }
    }

    /// Buffer one delta, returning any chunks that became ready.
    pub fn push_delta(&mut self, role: MessageRole, text: &str) -> Vec<DisplayChunk> {
        let mut out = Vec::new();
        if self.role.is_some_and(|current| current != role) {
            out.extend(self.finish());
        }
        self.role = Some(role);
        self.streamed = true;
        self.pending.push_str(text);

        while let Some(cut) = self.next_cut() {
            let head: String = self.pending.drain(..cut).collect();
            out.push(self.chunk(role, head));
        }
        out
    }

    /// Close the current block with a non-delta message.
    ///
    /// If deltas carried text for this role the streamed text is authoritative
    /// and `full` is ignored. Otherwise `full` is emitted as a single chunk.
    pub fn end_block(&mut self, role: MessageRole, full: &str) -> Vec<DisplayChunk> {
        let mut out = Vec::new();
        if self.role.is_some_and(|current| current != role) {
            out.extend(self.finish());
        }
        let streamed_text = self.emitted || !self.pending.is_empty();
        if self.role == Some(role) && self.streamed && streamed_text {
            out.extend(self.finish());
            return out;
        }
        self.reset();
        if !full.is_empty() {
            out.push(DisplayChunk {
                role,
                text: full.to_string(),
                starts_block: true,
            });
        }
        out
    }

    /// Flush whatever is pending and close the block.
    pub fn finish(&mut self) -> Option<DisplayChunk> {
        let role = self.role?;
        let rest = std::mem::take(&mut self.pending);
        let chunk = (!rest.is_empty()).then(|| self.chunk(role, rest));
        self.reset();
        chunk
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.role = None;
        self.streamed = false;
        self.emitted = false;
    }

    fn chunk(&mut self, role: MessageRole, text: String) -> DisplayChunk {
        let starts_block = !self.emitted;
        self.emitted = true;
        DisplayChunk {
            role,
            text,
            starts_block,
        }
    }

    /// Byte offset to flush through, if a flush point is present.
    fn next_cut(&self) -> Option<usize> {
        let boundary = BOUNDARIES
            .iter()
            .filter_map(|pat| self.pending.find(pat).map(|idx| idx + pat.len()))
            .min();
        let overflow = self
            .pending
            .char_indices()
            .nth(self.max_chars)
            .map(|(idx, _)| idx);
        [boundary, overflow].into_iter().flatten().min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(chunks: &[DisplayChunk]) -> Vec<&str> {
        chunks.iter().map(|chunk| chunk.text.as_str()).collect()
    }

    #[test]
    fn fragments_without_boundary_wait_for_end_event() {
        let mut buffer = DeltaBuffer::new();
        assert!(buffer.push_delta(MessageRole::Assistant, "/Users").is_empty());
        assert!(buffer.push_delta(MessageRole::Assistant, "/ken").is_empty());
        assert!(buffer.push_delta(MessageRole::Assistant, "ryu").is_empty());

        let flushed = buffer.end_block(MessageRole::Assistant, "/Users/kenryu");
        assert_eq!(texts(&flushed), vec!["/Users/kenryu"]);
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn sentence_boundary_flushes_through_the_space() {
        let mut buffer = DeltaBuffer::new();
        assert!(buffer.push_delta(MessageRole::Assistant, "Looks fine.").is_empty());
        let flushed = buffer.push_delta(MessageRole::Assistant, " Next one? Maybe");
        assert_eq!(texts(&flushed), vec!["Looks fine. ", "Next one? "]);
        assert!(flushed[0].starts_block);
        assert!(!flushed[1].starts_block);

        let rest = buffer.finish().expect("pending text");
        assert_eq!(rest.text, "Maybe");
    }

    #[test]
    fn paragraph_boundary_flushes() {
        let mut buffer = DeltaBuffer::new();
        let flushed = buffer.push_delta(MessageRole::Assistant, "heading\n\nbody");
        assert_eq!(texts(&flushed), vec!["heading\n\n"]);
    }

    #[test]
    fn overlong_buffer_flushes_exact_length_mid_word() {
        let mut buffer = DeltaBuffer::with_max_chars(4);
        let flushed = buffer.push_delta(MessageRole::Assistant, "abcdefghij");
        assert_eq!(texts(&flushed), vec!["abcd", "efgh"]);
        assert_eq!(buffer.finish().map(|chunk| chunk.text), Some("ij".to_string()));
    }

    #[test]
    fn end_event_without_deltas_emits_full_content() {
        let mut buffer = DeltaBuffer::new();
        let flushed = buffer.end_block(MessageRole::Thinking, "whole thought");
        assert_eq!(texts(&flushed), vec!["whole thought"]);
        assert_eq!(flushed[0].role, MessageRole::Thinking);
    }

    #[test]
    fn empty_deltas_fall_back_to_full_content() {
        let mut buffer = DeltaBuffer::new();
        assert!(buffer.push_delta(MessageRole::Assistant, "").is_empty());
        let flushed = buffer.end_block(MessageRole::Assistant, "x");
        assert_eq!(texts(&flushed), vec!["x"]);
        assert!(flushed[0].starts_block);
    }

    #[test]
    fn role_switch_closes_previous_block() {
        let mut buffer = DeltaBuffer::new();
        buffer.push_delta(MessageRole::Thinking, "pondering");
        let flushed = buffer.push_delta(MessageRole::Assistant, "Answer");
        assert_eq!(texts(&flushed), vec!["pondering"]);
        assert_eq!(flushed[0].role, MessageRole::Thinking);

        let flushed = buffer.end_block(MessageRole::Assistant, "Answer");
        assert_eq!(texts(&flushed), vec!["Answer"]);
    }

    #[test]
    fn chunks_concatenate_to_the_deltas() {
        let deltas = ["Fix the bug", ". Then", " run tests! Done", "\n\nok"];
        let mut buffer = DeltaBuffer::with_max_chars(7);
        let mut joined = String::new();
        for delta in deltas {
            for chunk in buffer.push_delta(MessageRole::Assistant, delta) {
                joined.push_str(&chunk.text);
            }
        }
        if let Some(chunk) = buffer.finish() {
            joined.push_str(&chunk.text);
        }
        assert_eq!(joined, deltas.concat());
    }
}

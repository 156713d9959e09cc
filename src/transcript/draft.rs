//! Live transcript span tracking
//!
//! Each segment owns one region of the host buffer. Partial and final
//! updates both replace that whole region, so only the newest hypothesis
//! ever remains in the text.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::buffer::TextBuffer;

/// Region of the buffer holding the current segment's text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftSpan {
    pub start: usize,
    pub len: usize,
}

impl DraftSpan {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

#[derive(Debug, Clone, Default)]
pub struct DraftMerger {
    span: DraftSpan,
}

impl DraftMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn span(&self) -> DraftSpan {
        self.span
    }

    /// Start an empty span at `start` (a fresh session)
    pub fn reset(&mut self, start: usize) {
        self.span = DraftSpan { start, len: 0 };
    }

    /// Replace the span's text with `text`
    pub fn apply(&mut self, buf: &mut dyn TextBuffer, text: &str) {
        let len = buf.len();
        let start = self.span.start.min(len);
        let end = self.span.end().clamp(start, len);

        buf.replace_range(start, end, text);
        self.span = DraftSpan {
            start,
            len: text.chars().count(),
        };
    }

    /// Insert a newline after the current span and open an empty one behind it
    pub fn begin_new_segment(&mut self, buf: &mut dyn TextBuffer) {
        let pos = self.span.end().min(buf.len());
        buf.replace_range(pos, pos, "\n");
        self.span = DraftSpan {
            start: pos + 1,
            len: 0,
        };
        debug!("New draft span at {}", self.span.start);
    }
}

use std::sync::Arc;
use tokio::sync::Mutex;

/// Host text buffer the transcript is written into
///
/// Offsets count Unicode scalar values, not bytes.
pub trait TextBuffer: Send {
    /// Length in chars
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace `[start, end)` with `text`; callers pass in-bounds ranges
    fn replace_range(&mut self, start: usize, end: usize, text: &str);

    /// Insertion point for new text
    fn cursor_position(&self) -> usize;
}

pub type SharedBuffer = Arc<Mutex<dyn TextBuffer>>;

/// In-memory buffer with a cursor that follows the last write
#[derive(Debug, Clone, Default)]
pub struct StringBuffer {
    text: String,
    cursor: usize,
}

impl StringBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer pre-filled with `text`, cursor at the end
    pub fn with_text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            cursor: text.chars().count(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_cursor(&mut self, pos: usize) {
        self.cursor = pos.min(self.len());
    }

    /// Wrap into the shared form the session writes through
    pub fn shared(self) -> (Arc<Mutex<StringBuffer>>, SharedBuffer) {
        let concrete = Arc::new(Mutex::new(self));
        let shared: SharedBuffer = concrete.clone();
        (concrete, shared)
    }

    fn byte_offset(&self, chars: usize) -> usize {
        self.text
            .char_indices()
            .nth(chars)
            .map(|(i, _)| i)
            .unwrap_or(self.text.len())
    }
}

impl TextBuffer for StringBuffer {
    fn len(&self) -> usize {
        self.text.chars().count()
    }

    fn replace_range(&mut self, start: usize, end: usize, text: &str) {
        let len = self.len();
        let start = start.min(len);
        let end = end.clamp(start, len);
        let (from, to) = (self.byte_offset(start), self.byte_offset(end));
        self.text.replace_range(from..to, text);
        self.cursor = start + text.chars().count();
    }

    fn cursor_position(&self) -> usize {
        self.cursor
    }
}

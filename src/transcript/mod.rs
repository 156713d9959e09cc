pub mod buffer;
pub mod draft;

pub use buffer::{SharedBuffer, StringBuffer, TextBuffer};
pub use draft::{DraftMerger, DraftSpan};

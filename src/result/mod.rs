//! Result types for expect operations

mod error;

pub use error::{Error, PatternError};

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Result of a successful pattern match on a [`Terminal`](crate::terminal::Terminal).
///
/// Sessions turn this into their captured command output; the raw form is
/// available to anyone driving a terminal directly.
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// Index of the pattern that matched (0-based index into the pattern set).
    pub pattern_index: usize,

    /// The matched text.
    pub matched: String,

    /// Text received since the previous match and before this one.
    ///
    /// After sending a command and expecting the prompt, this is the echo of
    /// the command followed by its output.
    pub before: String,

    /// Captured groups (for regex patterns).
    ///
    /// Index 0 is the full match, index 1+ each captured group. Empty for
    /// exact patterns.
    pub captures: Vec<String>,
}

impl MatchResult {
    /// `before` followed by `matched`.
    pub fn full_text(&self) -> String {
        let mut text = String::with_capacity(self.before.len() + self.matched.len());
        text.push_str(&self.before);
        text.push_str(&self.matched);
        text
    }
}

//! Pattern matching for expect operations

mod matcher;

pub use matcher::Matcher;

use std::fmt;

use regex::bytes::Regex;

use crate::result::PatternError;

/// Pattern types for matching terminal output.
///
/// Prompts, password requests and status markers are all described with a
/// `Pattern`. Regex patterns are matched against raw bytes, so a multi-byte
/// character split across two reads never breaks a match.
///
/// # Examples
///
/// ```
/// use stxauto::Pattern;
///
/// // Exact string (fastest)
/// let login = Pattern::exact("login:");
///
/// // Regular expression
/// let prompt = Pattern::regex(r".*controller\-[01]\:~\$ ").unwrap();
///
/// // Special patterns
/// let eof = Pattern::Eof;
/// let timeout = Pattern::Timeout;
/// ```
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Exact byte string match.
    ///
    /// Uses Boyer-Moore-Horspool; prefer it whenever the text is known.
    Exact(String),

    /// Regular expression match with capture groups.
    Regex(Regex),

    /// Matches when the far end closes the stream.
    ///
    /// Including it turns EOF into a regular match instead of an error.
    Eof,

    /// Matches when the expect timeout elapses.
    ///
    /// Including it turns a timeout into a regular match instead of an error.
    Timeout,
}

impl Pattern {
    /// Create an exact string pattern.
    pub fn exact(s: impl Into<String>) -> Self {
        Pattern::Exact(s.into())
    }

    /// Create a regex pattern.
    ///
    /// # Errors
    ///
    /// Returns a regex error if the pattern is invalid.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Pattern::Regex(Regex::new(pattern)?))
    }

    /// Convert pattern to a matcher implementation.
    pub fn to_matcher(&self) -> Result<Box<dyn Matcher>, PatternError> {
        use matcher::{ExactMatcher, RegexMatcher};

        match self {
            Pattern::Exact(s) => Ok(Box::new(ExactMatcher::new(s.as_bytes())?)),
            Pattern::Regex(r) => Ok(Box::new(RegexMatcher::new(r.clone()))),
            Pattern::Eof | Pattern::Timeout => Err(PatternError::EmptyPattern),
        }
    }

    /// Check if this is a special pattern (EOF, Timeout).
    pub fn is_special(&self) -> bool {
        matches!(self, Pattern::Eof | Pattern::Timeout)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Exact(s) => write!(f, "'{}'", s.escape_debug()),
            Pattern::Regex(r) => write!(f, "'{}'", r.as_str()),
            Pattern::Eof => f.write_str("EOF"),
            Pattern::Timeout => f.write_str("TIMEOUT"),
        }
    }
}

/// One or more patterns to wait for; the index of the one that matched is reported.
///
/// Everything that takes patterns accepts `impl Into<PatternSet>`, so a single
/// [`Pattern`], an array, a `Vec` or a slice can be passed interchangeably.
///
/// ```
/// use stxauto::{Pattern, PatternSet};
///
/// let one: PatternSet = Pattern::exact("login:").into();
/// assert_eq!(one.len(), 1);
///
/// let many: PatternSet = [Pattern::exact("Password:"), Pattern::exact(":~$")].into();
/// assert_eq!(many.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct PatternSet(Vec<Pattern>);

impl PatternSet {
    /// Build a set from patterns.
    pub fn new(patterns: Vec<Pattern>) -> Self {
        Self(patterns)
    }

    /// Patterns in index order.
    pub fn patterns(&self) -> &[Pattern] {
        &self.0
    }

    /// Pattern at `index`.
    pub fn get(&self, index: usize) -> Option<&Pattern> {
        self.0.get(index)
    }

    /// Number of patterns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of the first special pattern of the given kind.
    pub(crate) fn position_of(&self, special: &Pattern) -> Option<usize> {
        self.0
            .iter()
            .position(|p| std::mem::discriminant(p) == std::mem::discriminant(special))
    }
}

impl From<Pattern> for PatternSet {
    fn from(pattern: Pattern) -> Self {
        Self(vec![pattern])
    }
}

impl From<&Pattern> for PatternSet {
    fn from(pattern: &Pattern) -> Self {
        Self(vec![pattern.clone()])
    }
}

impl From<Vec<Pattern>> for PatternSet {
    fn from(patterns: Vec<Pattern>) -> Self {
        Self(patterns)
    }
}

impl From<&[Pattern]> for PatternSet {
    fn from(patterns: &[Pattern]) -> Self {
        Self(patterns.to_vec())
    }
}

impl<const N: usize> From<[Pattern; N]> for PatternSet {
    fn from(patterns: [Pattern; N]) -> Self {
        Self(patterns.into())
    }
}

impl fmt::Display for PatternSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, p) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{p}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let set: PatternSet = [
            Pattern::exact("login:"),
            Pattern::regex(r"failed=.").unwrap(),
            Pattern::Eof,
        ]
        .into();
        assert_eq!(set.to_string(), "'login:', 'failed=.', EOF");
    }

    #[test]
    fn test_position_of_special() {
        let set: PatternSet = vec![Pattern::exact("a"), Pattern::Timeout, Pattern::Eof].into();
        assert_eq!(set.position_of(&Pattern::Eof), Some(2));
        assert_eq!(set.position_of(&Pattern::Timeout), Some(1));

        let plain: PatternSet = Pattern::exact("a").into();
        assert_eq!(plain.position_of(&Pattern::Eof), None);
    }

    #[test]
    fn test_special_has_no_matcher() {
        assert!(Pattern::Eof.to_matcher().is_err());
        assert!(Pattern::Timeout.is_special());
        assert!(!Pattern::exact("x").is_special());
    }

    #[test]
    fn test_invalid_regex() {
        assert!(Pattern::regex("(unclosed").is_err());
    }
}

//! Core type definitions for treecache
//!
//! Keys are dot-separated paths (`"a.b.c"`) that map one-to-one onto the
//! in-memory node tree and onto backing-store subjects. Patterns reuse the
//! same token syntax with a wildcard allowed in the last position.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Logical time of an operation, used for last-write-wins resolution.
pub type LogicalTime = i64;

/// Token separator in keys and subjects
pub const TOKEN_SEPARATOR: char = '.';

/// Wildcard matching exactly one token
pub const WILDCARD_SINGLE: &str = "*";

/// Wildcard matching this token and everything beneath it
pub const WILDCARD_SUBTREE: &str = ">";

/// Current wall time in nanoseconds since the Unix epoch
#[must_use]
pub fn now_nanos() -> LogicalTime {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Resolve a caller-supplied operation time. Negative means "now".
#[must_use]
pub fn resolve_op_time(op_time: LogicalTime) -> LogicalTime {
    if op_time < 0 { now_nanos() } else { op_time }
}

const fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '=' | '_' | '-' | '.')
}

fn validate_token(token: &str) -> Result<(), KeyError> {
    if token.is_empty() {
        return Err(KeyError::EmptyToken);
    }
    for c in token.chars() {
        if c == TOKEN_SEPARATOR || !is_key_char(c) {
            return Err(KeyError::InvalidChar(c));
        }
    }
    Ok(())
}

/// Validated dotted key
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
#[display("{_0}")]
pub struct Key(String);

impl Key {
    /// Create a new key (validates the character set and token structure)
    pub fn new(key: impl Into<String>) -> Result<Self, KeyError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    /// Build a key from already-validated tokens
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<Self, KeyError> {
        Self::new(join_tokens(tokens))
    }

    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the path tokens
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split(TOKEN_SEPARATOR)
    }

    /// Split into the parent tokens and the last token
    #[must_use]
    pub fn parent_and_last(&self) -> (Vec<&str>, &str) {
        let mut tokens: Vec<&str> = self.tokens().collect();
        // validated keys always have at least one token
        let last = tokens.pop().unwrap_or_default();
        (tokens, last)
    }

    fn validate(key: &str) -> Result<(), KeyError> {
        if key.is_empty() {
            return Err(KeyError::Empty);
        }
        if key.starts_with(TOKEN_SEPARATOR) || key.ends_with(TOKEN_SEPARATOR) {
            return Err(KeyError::EdgePeriod);
        }
        for c in key.chars() {
            if !is_key_char(c) {
                return Err(KeyError::InvalidChar(c));
            }
        }
        if key.contains("..") {
            return Err(KeyError::EmptyToken);
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", self.0)
    }
}

impl TryFrom<String> for Key {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Key {
    type Error = KeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when creating a key or pattern
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key cannot be empty")]
    Empty,
    #[error("key contains invalid character: {0:?}")]
    InvalidChar(char),
    #[error("key cannot start or end with a period")]
    EdgePeriod,
    #[error("key cannot contain an empty token")]
    EmptyToken,
    #[error("wildcard is only allowed as the last token")]
    MisplacedWildcard,
    #[error("pattern must end with a single-level wildcard")]
    LevelWildcardRequired,
}

/// Last token of a pattern
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatternTail {
    /// Exact child name
    Literal(String),
    /// `*`: every direct child
    Single,
    /// `>`: every descendant at any depth
    Subtree,
}

/// Parsed key pattern: a literal parent path plus a tail
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    parent: Vec<String>,
    tail: PatternTail,
}

impl Pattern {
    /// Parse a pattern such as `a.b.*`, `a.>`, `>` or `a.b.c`
    pub fn parse(pattern: &str) -> Result<Self, KeyError> {
        if pattern.is_empty() {
            return Err(KeyError::Empty);
        }
        let mut tokens: Vec<&str> = pattern.split(TOKEN_SEPARATOR).collect();
        let last = tokens.pop().unwrap_or_default();

        for token in &tokens {
            if *token == WILDCARD_SINGLE || *token == WILDCARD_SUBTREE {
                return Err(KeyError::MisplacedWildcard);
            }
            validate_token(token)?;
        }

        let tail = match last {
            WILDCARD_SINGLE => PatternTail::Single,
            WILDCARD_SUBTREE => PatternTail::Subtree,
            literal => {
                validate_token(literal)?;
                PatternTail::Literal(literal.to_string())
            }
        };

        Ok(Self {
            parent: tokens.into_iter().map(str::to_string).collect(),
            tail,
        })
    }

    /// Tokens of the literal parent path (empty for root-level patterns)
    #[must_use]
    pub fn parent(&self) -> &[String] {
        &self.parent
    }

    /// The pattern tail
    #[must_use]
    pub const fn tail(&self) -> &PatternTail {
        &self.tail
    }

    /// Whether the tail is a wildcard
    #[must_use]
    pub const fn is_wildcard(&self) -> bool {
        !matches!(self.tail, PatternTail::Literal(_))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for token in &self.parent {
            write!(f, "{token}{TOKEN_SEPARATOR}")?;
        }
        match &self.tail {
            PatternTail::Literal(token) => write!(f, "{token}"),
            PatternTail::Single => write!(f, "{WILDCARD_SINGLE}"),
            PatternTail::Subtree => write!(f, "{WILDCARD_SUBTREE}"),
        }
    }
}

/// Join tokens with the separator
#[must_use]
pub fn join_tokens<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut out = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            out.push(TOKEN_SEPARATOR);
        }
        out.push_str(token.as_ref());
    }
    out
}

/// Append one token to an optional dotted prefix
#[must_use]
pub fn child_path(prefix: &str, token: &str) -> String {
    if prefix.is_empty() {
        token.to_string()
    } else {
        let mut out = String::with_capacity(prefix.len() + 1 + token.len());
        out.push_str(prefix);
        out.push(TOKEN_SEPARATOR);
        out.push_str(token);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_valid() {
        assert!(Key::new("a").is_ok());
        assert!(Key::new("a.b.c").is_ok());
        assert!(Key::new("vertex=1_x-y.out").is_ok());
    }

    #[test]
    fn test_key_invalid() {
        assert_eq!(Key::new(""), Err(KeyError::Empty));
        assert_eq!(Key::new(".a"), Err(KeyError::EdgePeriod));
        assert_eq!(Key::new("a."), Err(KeyError::EdgePeriod));
        assert_eq!(Key::new("a..b"), Err(KeyError::EmptyToken));
        assert_eq!(Key::new("a b"), Err(KeyError::InvalidChar(' ')));
        assert_eq!(Key::new("a.*"), Err(KeyError::InvalidChar('*')));
        assert_eq!(Key::new("a/b"), Err(KeyError::InvalidChar('/')));
    }

    #[test]
    fn test_key_parent_and_last() {
        let key = Key::new("a.b.c").unwrap();
        let (parent, last) = key.parent_and_last();
        assert_eq!(parent, vec!["a", "b"]);
        assert_eq!(last, "c");

        let key = Key::new("root").unwrap();
        let (parent, last) = key.parent_and_last();
        assert!(parent.is_empty());
        assert_eq!(last, "root");
    }

    #[test]
    fn test_key_try_from() {
        let key = Key::try_from("a.b".to_string()).unwrap();
        assert_eq!(key.as_str(), "a.b");
        assert_eq!(String::from(key), "a.b");
        assert!(Key::try_from("a..b").is_err());
        assert_eq!(Key::from_tokens(&["x", "y"]).unwrap().as_str(), "x.y");
    }

    #[test]
    fn test_pattern_parse() {
        let p = Pattern::parse("a.b.*").unwrap();
        assert_eq!(p.parent(), ["a", "b"]);
        assert_eq!(p.tail(), &PatternTail::Single);

        let p = Pattern::parse(">").unwrap();
        assert!(p.parent().is_empty());
        assert_eq!(p.tail(), &PatternTail::Subtree);

        let p = Pattern::parse("a.c").unwrap();
        assert_eq!(p.tail(), &PatternTail::Literal("c".into()));
        assert!(!p.is_wildcard());

        assert_eq!(p.to_string(), "a.c");
        assert_eq!(Pattern::parse("x.>").unwrap().to_string(), "x.>");
    }

    #[test]
    fn test_pattern_invalid() {
        assert_eq!(Pattern::parse("a.*.c"), Err(KeyError::MisplacedWildcard));
        assert_eq!(Pattern::parse("a.>.c"), Err(KeyError::MisplacedWildcard));
        assert_eq!(Pattern::parse("a..*"), Err(KeyError::EmptyToken));
        assert_eq!(Pattern::parse(""), Err(KeyError::Empty));
    }

    #[test]
    fn test_resolve_op_time() {
        assert_eq!(resolve_op_time(42), 42);
        assert!(resolve_op_time(-1) > 0);
    }

    #[test]
    fn test_join() {
        assert_eq!(join_tokens(&["a", "b"]), "a.b");
        assert_eq!(child_path("", "a"), "a");
        assert_eq!(child_path("a.b", "c"), "a.b.c");
    }
}

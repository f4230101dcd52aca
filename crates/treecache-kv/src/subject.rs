//! Subject addressing and wildcard matching
//!
//! Subjects are dot-separated tokens. In patterns, `*` matches exactly one
//! token and `>` matches one or more trailing tokens; `>` is only legal as
//! the last token, and `a.>` never matches `a` itself.

use crate::error::{KvError, KvResult};

const SEPARATOR: char = '.';
const SINGLE: &str = "*";
const FULL: &str = ">";

fn check_tokens(s: &str, allow_wildcards: bool) -> KvResult<()> {
    if s.is_empty() {
        return Err(KvError::InvalidSubject(s.to_string()));
    }
    let mut tokens = s.split(SEPARATOR).peekable();
    while let Some(token) = tokens.next() {
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            return Err(KvError::InvalidSubject(s.to_string()));
        }
        let is_wildcard = token == SINGLE || token == FULL;
        if is_wildcard && !allow_wildcards {
            return Err(KvError::InvalidSubject(s.to_string()));
        }
        if !is_wildcard && (token.contains('*') || token.contains('>')) {
            return Err(KvError::InvalidSubject(s.to_string()));
        }
        if token == FULL && tokens.peek().is_some() {
            return Err(KvError::InvalidSubject(s.to_string()));
        }
    }
    Ok(())
}

/// Validate a literal subject (no wildcards)
pub fn validate_subject(subject: &str) -> KvResult<()> {
    check_tokens(subject, false)
}

/// Validate a wildcard pattern
pub fn validate_pattern(pattern: &str) -> KvResult<()> {
    check_tokens(pattern, true)
}

/// Check whether `subject` matches `pattern`
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut p = pattern.split(SEPARATOR);
    let mut s = subject.split(SEPARATOR);
    loop {
        match (p.next(), s.next()) {
            (Some(FULL), Some(_)) => return true,
            (Some(SINGLE), Some(_)) => {}
            (Some(pt), Some(st)) if pt == st => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Literal prefix of a pattern up to the first wildcard token, including
/// the trailing separator. Used to narrow ordered scans.
#[must_use]
pub fn literal_prefix(pattern: &str) -> String {
    let mut prefix = String::new();
    for token in pattern.split(SEPARATOR) {
        if token == SINGLE || token == FULL {
            return prefix;
        }
        prefix.push_str(token);
        prefix.push(SEPARATOR);
    }
    // fully literal pattern: the exact subject
    prefix.pop();
    prefix
}

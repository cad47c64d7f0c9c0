//! Subjects and subject filters.
//!
//! Subjects are dot-separated token lists (`orders.us.created`). Filters use
//! NATS-style wildcards:
//! - `*` matches exactly one token: `foo.*` matches `foo.a` but not `foo.a.b`
//! - `>` matches one or more trailing tokens and must be the last token:
//!   `foo.>` matches `foo.a` and `foo.a.b` but not `foo`
//!
//! Published subjects never contain wildcard tokens.

use std::fmt;

/// Token separator.
pub const TOKEN_SEPARATOR: char = '.';
/// Single-token wildcard.
pub const WILDCARD_SINGLE: &str = "*";
/// Trailing multi-token wildcard.
pub const WILDCARD_MULTI: &str = ">";

/// Errors raised while validating subjects and filters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubjectError {
    #[error("Subject is empty")]
    Empty,

    #[error("Subject '{0}' contains an empty token")]
    EmptyToken(String),

    #[error("Subject '{0}' contains whitespace")]
    Whitespace(String),

    #[error("Published subject '{0}' must not contain wildcards")]
    WildcardInSubject(String),

    #[error("Filter '{0}' uses '>' before its last token")]
    MisplacedFullWildcard(String),
}

fn validate_tokens(raw: &str) -> Result<(), SubjectError> {
    if raw.is_empty() {
        return Err(SubjectError::Empty);
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(SubjectError::Whitespace(raw.to_string()));
    }
    if raw.split(TOKEN_SEPARATOR).any(str::is_empty) {
        return Err(SubjectError::EmptyToken(raw.to_string()));
    }
    Ok(())
}

/// A literal subject a message is published on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subject(String);

impl Subject {
    /// Validate and wrap a literal subject.
    pub fn new(raw: impl Into<String>) -> Result<Self, SubjectError> {
        let raw = raw.into();
        validate_tokens(&raw)?;
        if raw
            .split(TOKEN_SEPARATOR)
            .any(|t| t == WILDCARD_SINGLE || t == WILDCARD_MULTI)
        {
            return Err(SubjectError::WildcardInSubject(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split(TOKEN_SEPARATOR)
    }

    /// Prepend `prefix` as leading token(s).
    pub fn with_prefix(&self, prefix: &str) -> Result<Self, SubjectError> {
        Self::new(format!("{prefix}{TOKEN_SEPARATOR}{}", self.0))
    }

    /// Remove a leading `prefix` token group, if present.
    ///
    /// Returns `None` when the subject does not start with `prefix.` or when
    /// nothing would remain after stripping.
    pub fn strip_prefix(&self, prefix: &str) -> Option<Self> {
        let rest = self.0.strip_prefix(prefix)?.strip_prefix(TOKEN_SEPARATOR)?;
        Self::new(rest).ok()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A subject pattern that may contain wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectFilter(String);

impl SubjectFilter {
    /// Validate and wrap a filter pattern.
    pub fn new(raw: impl Into<String>) -> Result<Self, SubjectError> {
        let raw = raw.into();
        validate_tokens(&raw)?;
        let tokens: Vec<&str> = raw.split(TOKEN_SEPARATOR).collect();
        let last = tokens.len() - 1;
        if tokens[..last].iter().any(|t| *t == WILDCARD_MULTI) {
            return Err(SubjectError::MisplacedFullWildcard(raw));
        }
        Ok(Self(raw))
    }

    /// The filter that admits every subject.
    pub fn all() -> Self {
        Self(WILDCARD_MULTI.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this filter admits every subject.
    pub fn is_all(&self) -> bool {
        self.0 == WILDCARD_MULTI
    }

    /// Check whether a literal subject is admitted by this filter.
    pub fn matches(&self, subject: &str) -> bool {
        subject_matches(subject, &self.0)
    }

    /// Check whether some subject could be admitted by both filters.
    pub fn overlaps(&self, other: &SubjectFilter) -> bool {
        filters_overlap(&self.0, &other.0)
    }
}

impl fmt::Display for SubjectFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token-wise wildcard match of a literal subject against a filter.
pub fn subject_matches(subject: &str, filter: &str) -> bool {
    let mut subject_tokens = subject.split(TOKEN_SEPARATOR);
    for pattern in filter.split(TOKEN_SEPARATOR) {
        if pattern == WILDCARD_MULTI {
            return subject_tokens.next().is_some();
        }
        match subject_tokens.next() {
            Some(token) if pattern == WILDCARD_SINGLE || pattern == token => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}

/// Check whether two filters can admit a common subject.
pub fn filters_overlap(a: &str, b: &str) -> bool {
    let mut a_tokens = a.split(TOKEN_SEPARATOR);
    let mut b_tokens = b.split(TOKEN_SEPARATOR);
    loop {
        match (a_tokens.next(), b_tokens.next()) {
            (None, None) => return true,
            (Some(WILDCARD_MULTI), Some(_)) | (Some(_), Some(WILDCARD_MULTI)) => return true,
            (Some(x), Some(y)) => {
                if x != y && x != WILDCARD_SINGLE && y != WILDCARD_SINGLE {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// True if `subject` is admitted by at least one filter in the set.
pub fn any_matches(filters: &[SubjectFilter], subject: &str) -> bool {
    filters.iter().any(|f| f.matches(subject))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_rejects_wildcards() {
        assert_eq!(
            Subject::new("foo.*"),
            Err(SubjectError::WildcardInSubject("foo.*".to_string()))
        );
        assert!(Subject::new("foo.>").is_err());
        assert!(Subject::new("foo.a").is_ok());
    }

    #[test]
    fn test_subject_rejects_malformed() {
        assert_eq!(Subject::new(""), Err(SubjectError::Empty));
        assert!(matches!(Subject::new("foo..a"), Err(SubjectError::EmptyToken(_))));
        assert!(matches!(Subject::new(".foo"), Err(SubjectError::EmptyToken(_))));
        assert!(matches!(Subject::new("foo a"), Err(SubjectError::Whitespace(_))));
    }

    #[test]
    fn test_filter_full_wildcard_must_be_last() {
        assert!(SubjectFilter::new("foo.>").is_ok());
        assert!(SubjectFilter::new(">").is_ok());
        assert_eq!(
            SubjectFilter::new("foo.>.bar"),
            Err(SubjectError::MisplacedFullWildcard("foo.>.bar".to_string()))
        );
    }

    #[test]
    fn test_single_wildcard_matches_one_token() {
        assert!(subject_matches("foo.a", "foo.*"));
        assert!(subject_matches("foo.b", "foo.*"));
        assert!(!subject_matches("foo", "foo.*"));
        assert!(!subject_matches("foo.a.b", "foo.*"));
        assert!(subject_matches("foo.a.b", "foo.*.b"));
        assert!(!subject_matches("bar.a", "foo.*"));
    }

    #[test]
    fn test_full_wildcard_matches_one_or_more_tokens() {
        assert!(subject_matches("foo.a", "foo.>"));
        assert!(subject_matches("foo.a.b.c", "foo.>"));
        assert!(!subject_matches("foo", "foo.>"));
        assert!(subject_matches("anything", ">"));
        assert!(subject_matches("foo.b", ">"));
    }

    #[test]
    fn test_literal_filter_is_exact() {
        assert!(subject_matches("foo.b", "foo.b"));
        assert!(!subject_matches("foo.a", "foo.b"));
        assert!(!subject_matches("foo.b.c", "foo.b"));
    }

    #[test]
    fn test_filters_overlap() {
        assert!(filters_overlap("foo.*", "foo.a"));
        assert!(filters_overlap("foo.*", "*.a"));
        assert!(filters_overlap(">", "foo"));
        assert!(filters_overlap("foo.>", "foo.a.b"));
        assert!(!filters_overlap("foo.>", "foo"));
        assert!(!filters_overlap("foo.*", "bar.*"));
        assert!(!filters_overlap("foo.*", "foo.a.b"));
        assert!(!filters_overlap("orders", "orders.created"));
    }

    #[test]
    fn test_prefix_round_trip() {
        let subject = Subject::new("foo.b").unwrap();
        let delivered = subject.with_prefix("testB").unwrap();
        assert_eq!(delivered.as_str(), "testB.foo.b");
        assert_eq!(delivered.strip_prefix("testB"), Some(subject));
        assert_eq!(delivered.strip_prefix("test"), None);
        assert_eq!(Subject::new("testB").unwrap().strip_prefix("testB"), None);
    }
}

//! Colon-delimited key segments with backslash escaping.
//!
//! Inside a segment `\` is written as `\\` and `:` as `\:`. Unescaped colons
//! delimit segments, so any string round-trips through a segment.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    #[error("dangling escape at end of key")]
    DanglingEscape,

    #[error("unknown escape sequence `\\{0}`")]
    UnknownEscape(char),
}

/// Escape one segment. Backslashes go first so colons are not double-escaped.
#[must_use]
pub fn escape_segment(segment: &str) -> String {
    segment.replace('\\', "\\\\").replace(':', "\\:")
}

/// Join escaped segments with `:`.
#[must_use]
pub fn join_segments<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(|s| escape_segment(s.as_ref()))
        .collect::<Vec<_>>()
        .join(":")
}

/// Split on unescaped `:` and unescape every segment.
pub fn split_segments(key: &str) -> Result<Vec<String>, SegmentError> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = key.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('\\' | ':')) => current.push(escaped),
                Some(other) => return Err(SegmentError::UnknownEscape(other)),
                None => return Err(SegmentError::DanglingEscape),
            },
            ':' => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);

    Ok(segments)
}

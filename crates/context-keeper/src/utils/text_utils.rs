//! Text helpers for log lines and previews

use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
}

/// Collapse runs of whitespace (newlines included) into single spaces.
pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
    if text.contains(|c: char| c.is_whitespace() && c != ' ') || text.contains("  ") {
        Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
    } else {
        Cow::Borrowed(text.trim())
    }
}

/// Truncate to at most `max_chars` characters, ending in "..." when cut.
/// Counts characters, not bytes, so multi-byte text never splits mid-char.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
    if text.chars().count() <= max_chars {
        return Cow::Borrowed(text);
    }
    if max_chars <= 3 {
        return Cow::Borrowed("...");
    }
    let cut = text
        .char_indices()
        .nth(max_chars - 3)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let mut result = String::with_capacity(cut + 3);
    result.push_str(&text[..cut]);
    result.push_str("...");
    Cow::Owned(result)
}

/// Single-line preview of message content for log output.
pub fn preview(text: &str, max_chars: usize) -> String {
    truncate_with_ellipsis(&normalize_whitespace(text), max_chars).into_owned()
}

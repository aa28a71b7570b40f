//! Extraction of the reported image size from builder probe output.
//!
//! Builder versions word the size report differently. Each wording is a
//! [`SizeRule`]; rules are tried in order and the first one that matches a
//! line and yields a positive integer wins for that line. New wordings are
//! added to [`SIZE_RULES`] without touching callers.

use regex::Regex;
use std::sync::LazyLock;

/// Digits with optional thousands separators: `,` `.` NBSP or narrow NBSP.
const NUMBER: &str = r"([0-9][0-9,.\x{00A0}\x{202F}]*)";

struct SizeRule {
    name: &'static str,
    pattern: Regex,
}

static SIZE_RULES: LazyLock<Vec<SizeRule>> = LazyLock::new(|| {
    [
        (
            "image size",
            format!(r"(?i)image\s+size\s*[:=]?\s*{NUMBER}\s*bytes"),
        ),
        (
            "would be",
            format!(r"(?i)image\s+would\s+(?:be|require|need)\s*{NUMBER}\s*bytes"),
        ),
        (
            "required size",
            format!(r"(?i)(?:required|needed|minimum|total)\s+size\s*[:=]?\s*{NUMBER}\s*bytes"),
        ),
        (
            "bytes required",
            format!(r"(?i){NUMBER}\s*bytes\s+(?:required|needed)"),
        ),
        ("size", format!(r"(?i)\bsize\s*[:=]\s*{NUMBER}\s*(?:bytes|b)\b")),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| {
        Regex::new(&pattern)
            .ok()
            .map(|pattern| SizeRule { name, pattern })
    })
    .collect()
});

/// Parse a separator-tolerant integer (`1,234,567`, `1.234.567`, or grouped
/// with NBSP / narrow NBSP). ASCII spaces never reach here: the `NUMBER` pattern stops at them.
pub fn parse_grouped_number(raw: &str) -> Option<u64> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Size reported on a single line, if any rule matches it.
pub fn parse_size_line(line: &str) -> Option<u64> {
    SIZE_RULES.iter().find_map(|rule| {
        let caps = rule.pattern.captures(line)?;
        let size = parse_grouped_number(caps.get(1)?.as_str())?;
        if size == 0 {
            return None;
        }
        tracing::trace!("size rule '{}' matched: {}", rule.name, line);
        Some(size)
    })
}

/// The image size reported by a whole probe transcript.
///
/// When several lines report a size the last one wins: builders print
/// intermediate estimates before the final figure.
pub fn parse_reported_size(output: &str) -> Option<u64> {
    output.lines().filter_map(parse_size_line).last()
}

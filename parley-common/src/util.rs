//! Text helpers shared by the relay crates.

use std::sync::OnceLock;

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// This function safely handles multi-byte UTF-8 characters (emoji, CJK, accented characters)
/// by using character boundaries instead of byte indices.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Keep the first `max_chars` characters of `s`, without any marker.
pub fn take_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Keep the trailing `max_chars` characters of `s`.
pub fn tail_chars(s: &str, max_chars: usize) -> &str {
    let total = s.chars().count();
    if total <= max_chars {
        return s;
    }
    match s.char_indices().nth(total - max_chars) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}

/// Secret-bearing patterns and their replacements. Telegram Bot API URLs
/// embed the bot token in the path.
const REDACTIONS: &[(&str, &str)] = &[
    (r"/bot\d+:[A-Za-z0-9_-]+", "/bot***REDACTED***"),
    (r"(?i)(api[_-]?key|apikey)[=:]\s*\S{20,}", "$1=***REDACTED***"),
    (r"(?i)(token|secret|bearer)\s*[=:]\s*\S{10,}", "$1=***REDACTED***"),
    (r"sk-[a-zA-Z0-9]{20,}", "***REDACTED_API_KEY***"),
];

fn redaction_rules() -> &'static [(regex::Regex, &'static str)] {
    static RULES: OnceLock<Vec<(regex::Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        REDACTIONS
            .iter()
            .filter_map(|(pattern, replacement)| {
                regex::Regex::new(pattern).ok().map(|re| (re, *replacement))
            })
            .collect()
    })
}

/// Redact tokens and keys before a string reaches the logs.
pub fn sanitize_for_log(s: &str) -> String {
    redaction_rules()
        .iter()
        .fold(s.to_string(), |acc, (re, replacement)| {
            re.replace_all(&acc, *replacement).into_owned()
        })
}

/// Parse a duration like `90`, `30s`, `5m`, `1h` or `2d` into seconds.
/// A bare number is seconds.
pub fn parse_duration_secs(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let Some(unit) = s.chars().last() else {
        return Err("Empty duration string".into());
    };

    if unit.is_ascii_digit() {
        return s.parse().map_err(|_| format!("Invalid number: {s}"));
    }

    let num_str = &s[..s.len() - unit.len_utf8()];
    let num: u64 = num_str.trim().parse().map_err(|_| format!("Invalid number: {num_str}"))?;
    let scale = match unit.to_ascii_lowercase() {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        _ => return Err(format!("Unknown unit: {unit}")),
    };
    num.checked_mul(scale)
        .ok_or_else(|| format!("Duration too large: {s}"))
}

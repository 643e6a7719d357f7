//! String helpers shared across the workspace.

/// Keep at most `max_chars` characters of `s`.
///
/// Counts `char`s, so multi-byte text (CJK, emoji) is never split mid-character.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Sanitize a string for safe logging (redact credentials).
pub fn sanitize_for_log(s: &str) -> String {
    let patterns: &[(&str, &str)] = &[
        (r"(?i)(authorization:\s*bearer)\s+\S+", "$1 ***REDACTED***"),
        (r"(?i)(bearer)\s+[A-Za-z0-9\-._~+/]{10,}=*", "$1 ***REDACTED***"),
        (r#"(?i)"?(access_?token|accessToken|token|secret|password)"?\s*[=:]\s*"?[^\s",}]+"?"#, "$1=***REDACTED***"),
    ];

    let mut result = s.to_string();
    for (pattern, replacement) in patterns {
        if let Ok(re) = regex::Regex::new(pattern) {
            result = re.replace_all(&result, *replacement).to_string();
        }
    }
    result
}

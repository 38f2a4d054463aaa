//! Shared utilities for pingtest.

/// Truncate a string to at most `max_chars` characters.
///
/// Counts `char`s rather than bytes so multi-byte device output is never
/// split inside a code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Mask a secret for log output, keeping only its length visible.
pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        format!("***({} chars)", secret.chars().count())
    }
}

/// Render terminal output for a single-line log field.
///
/// Escapes CR/LF and caps the length so a whole ping transcript never lands
/// in one log line.
pub fn log_snippet(output: &str, max_chars: usize) -> String {
    let escaped = output.replace('\r', "\\r").replace('\n', "\\n");
    let mut snippet = truncate_chars(&escaped, max_chars);
    if escaped.chars().count() > max_chars {
        snippet.push_str("...");
    }
    snippet
}

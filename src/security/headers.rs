//! Credential redaction for anything that reaches a log line.
//!
//! Outbound requests always carry the real header values; only copies made
//! for logging or error envelopes go through these functions.

use regex::Regex;
use std::sync::OnceLock;

/// Replacement value for redacted headers and secrets.
pub const REDACTED: &str = "[REDACTED]";

/// Substrings that mark a header name as credential-bearing.
const SENSITIVE_NAME_PARTS: &[&str] = &[
    "authorization",
    "key",
    "secret",
    "token",
    "password",
    "cookie",
    "credential",
];

/// True if a header with this name must never be logged verbatim.
pub fn is_sensitive_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_NAME_PARTS.iter().any(|part| lower.contains(part))
}

/// Copy of `headers` with credential-like values replaced by [`REDACTED`].
pub fn sanitize_headers<I, K, V>(headers: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    headers
        .into_iter()
        .map(|(name, value)| {
            let name = name.as_ref().to_string();
            let value = if is_sensitive_header(&name) {
                REDACTED.to_string()
            } else {
                value.as_ref().to_string()
            };
            (name, value)
        })
        .collect()
}

fn secret_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"(?i)bearer\s+[A-Za-z0-9._~+/=\-]{8,}", "Bearer [REDACTED]"),
            (r"sk-[A-Za-z0-9_\-]{16,}", REDACTED),
            (r"\b[0-9a-fA-F]{32,}\b", REDACTED),
            (r"[A-Za-z0-9+/]{24,}={0,2}", REDACTED),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
            Ok(re) => Some((re, replacement)),
            Err(e) => {
                tracing::error!("Invalid redaction pattern {}: {}", pattern, e);
                None
            }
        })
        .collect()
    })
}

/// Redact API keys, bearer tokens and long hex/base64 runs from free text.
pub fn sanitize_error_message(message: &str) -> String {
    let mut out = message.to_string();
    for (re, replacement) in secret_patterns() {
        if re.is_match(&out) {
            out = re.replace_all(&out, *replacement).into_owned();
        }
    }
    out
}

//! Redaction of secret-shaped values from trace payloads and log lines.
//!
//! Two complementary strategies are offered: [`redact_secrets`] scrubs free
//! text (log lines, error messages), while [`sanitize_json`] walks a
//! structured `serde_json::Value` and redacts values whose *key* looks like
//! a credential, which is what the trace collector needs when it
//! sanitizes `args`/`result` before finalizing a trace.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

const REDACTED: &str = "[REDACTED_SECRET]";
const MAX_STRING_LEN: usize = 4096;

static OPENAI_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| compile(r"sk-[A-Za-z0-9]{20,}"));
static BEARER_TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(?i)\bBearer\s+[A-Za-z0-9.\-_]{16,}\b"));
static SECRET_ASSIGNMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    compile(r#"(?i)\b(api[\-_]?key|token|secret|password)\b(\s*[:=]\s*)(["']?)[^\s"']{8,}"#)
});

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|err| panic!("invalid regex pattern `{pattern}`: {err}"))
}

/// Best-effort redaction of secret-shaped substrings from free text.
pub fn redact_secrets(input: &str) -> String {
    let redacted = OPENAI_KEY_REGEX.replace_all(input, REDACTED);
    let redacted = BEARER_TOKEN_REGEX.replace_all(&redacted, "Bearer [REDACTED_SECRET]");
    let redacted = SECRET_ASSIGNMENT_REGEX.replace_all(&redacted, "$1$2$3[REDACTED_SECRET]");
    redacted.into_owned()
}

/// The default set of key-name glob patterns the Trace Collector treats as
/// secret-shaped. `*` matches any run of characters; matching is
/// case-insensitive.
pub fn default_secret_key_patterns() -> Vec<String> {
    vec![
        "*key*".to_string(),
        "*token*".to_string(),
        "*password*".to_string(),
        "*secret*".to_string(),
        "Authorization".to_string(),
    ]
}

fn key_matches(key: &str, patterns: &[String]) -> bool {
    let key_lower = key.to_ascii_lowercase();
    patterns.iter().any(|pattern| glob_match(&pattern.to_ascii_lowercase(), &key_lower))
}

/// Minimal `*`-glob matcher; patterns contain at most a handful of `*`s so a
/// naive split-and-scan is both correct and fast enough.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut segments = pattern.split('*').peekable();
    let mut cursor = 0usize;
    let anchored_start = !pattern.starts_with('*');
    let anchored_end = !pattern.ends_with('*');
    let mut first = true;

    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            first = false;
            continue;
        }
        match text[cursor..].find(segment) {
            Some(offset) => {
                if first && anchored_start && offset != 0 {
                    return false;
                }
                cursor += offset + segment.len();
            }
            None => return false,
        }
        first = false;
        if segments.peek().is_none() && anchored_end && cursor != text.len() {
            return false;
        }
    }
    true
}

/// Recursively redact a JSON value, replacing any string value reachable
/// through a key matching `patterns` with [`REDACTED`], and truncating
/// oversize string values that survive redaction.
pub fn sanitize_json(value: Value, patterns: &[String]) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                if key_matches(&key, patterns) {
                    out.insert(key, Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key, sanitize_json(val, patterns));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| sanitize_json(v, patterns)).collect())
        }
        Value::String(s) if s.len() > MAX_STRING_LEN => {
            Value::String(format!("{}...[truncated {} bytes]", &s[..MAX_STRING_LEN], s.len()))
        }
        other => other,
    }
}

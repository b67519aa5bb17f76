//! Input sanitization for untrusted free text and filenames.
//!
//! Sanitizers never fail: every input maps to some output, possibly empty.

use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum filename length, in characters.
pub const MAX_FILENAME_CHARS: usize = 255;

static SCRIPT_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<\s*script\b[^>]*>.*?<\s*/\s*script\s*>").unwrap());
static STYLE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<\s*style\b[^>]*>.*?<\s*/\s*style\s*>").unwrap());
// An opening script tag with no close swallows the rest of the input.
static UNCLOSED_SCRIPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<\s*script\b.*$").unwrap());
// Unquoted handler values must look like a call so prose such as
// "one = 2x" survives.
static EVENT_HANDLER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bon[a-z]{3,}\s*=\s*("[^"]*"|'[^']*'|[^\s>]*\([^\s>]*)"#).unwrap()
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
// `data:` only counts when a media type follows.
static URI_SCHEME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:javascript\s*:|vbscript\s*:|data:[a-z-]+/)").unwrap()
});
static SPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ ]{2,}").unwrap());

/// Strip markup, script content, inline event handlers, executable URI
/// schemes, and control characters (except newline and tab).
///
/// ```rust
/// use campus_chat_core::sanitize::sanitize;
///
/// assert_eq!(sanitize("Hello <script>alert(1)</script> World"), "Hello World");
/// ```
pub fn sanitize(raw: &str) -> String {
    let text = SCRIPT_BLOCK.replace_all(raw, "");
    let text = STYLE_BLOCK.replace_all(&text, "");
    let text = UNCLOSED_SCRIPT.replace_all(&text, "");
    let text = EVENT_HANDLER.replace_all(&text, "");
    let text = TAG.replace_all(&text, "");
    let text = URI_SCHEME.replace_all(&text, "");

    let text: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    SPACE_RUN.replace_all(&text, " ").trim().to_string()
}

/// Sanitize a JSON field that should hold text.
///
/// Absent values and non-string values yield an empty string.
pub fn sanitize_value(value: Option<&serde_json::Value>) -> String {
    match value.and_then(|v| v.as_str()) {
        Some(s) => sanitize(s),
        None => String::new(),
    }
}

/// Make a user-supplied name safe to persist as a document or file name.
///
/// Path separators, reserved characters, and control characters become
/// `_`; leading dots are dropped; the result is capped at
/// [`MAX_FILENAME_CHARS`] characters. An empty result becomes `"unnamed"`.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim_start_matches('.');
    let truncated: String = trimmed.chars().take(MAX_FILENAME_CHARS).collect();

    if truncated.is_empty() {
        "unnamed".to_string()
    } else {
        truncated
    }
}

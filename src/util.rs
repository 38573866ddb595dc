//! Small string helpers shared across the workflow.

use autoship_common::redact_userinfo;
use regex::Regex;
use std::sync::LazyLock;

static URL_WITH_USERINFO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s/@]+@[^\s]+").expect("static regex"));

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object, skipping braces
/// that appear inside string literals.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }

    None
}

/// Convert free text to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Strip secrets from a message before it leaves the session.
///
/// Every non-empty entry of `secrets` is replaced with `***`, and any URL
/// carrying userinfo has it redacted.
pub fn sanitize(message: &str, secrets: &[&str]) -> String {
    let mut out = message.to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        out = out.replace(secret, "***");
    }
    URL_WITH_USERINFO
        .replace_all(&out, |caps: &regex::Captures<'_>| redact_userinfo(&caps[0]))
        .into_owned()
}

/// Keep at most `max` bytes from the end of `text`, on a char boundary.
pub fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// Keep at most `max` bytes from the start of `text`, on a char boundary.
pub fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

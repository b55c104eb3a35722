use std::sync::OnceLock;

use regex::Regex;

/// Path segment used for evidence that is not linked to a case yet.
pub const UNLINKED_SEGMENT: &str = "unlinked";

fn unsafe_chars() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]").ok())
        .as_ref()
}

/// Make a caller-supplied value safe to use as a single path segment.
pub fn sanitize_segment(value: &str) -> String {
    let value = value.trim();
    let replaced = match unsafe_chars() {
        Some(pattern) => pattern.replace_all(value, "_").into_owned(),
        None => value
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "._-".contains(c) { c } else { '_' })
            .collect(),
    };
    let cleaned = replaced.replace("..", "_");
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Build the backend-relative locator for an evidence object:
/// `{user_id}/{case_id|unlinked}/{evidence_id}_{filename}`.
pub fn build_locator(
    user_id: &str,
    case_id: Option<&str>,
    evidence_id: &str,
    filename: &str,
) -> String {
    let case_segment = case_id
        .map(sanitize_segment)
        .unwrap_or_else(|| UNLINKED_SEGMENT.to_string());
    format!(
        "{}/{}/{}_{}",
        sanitize_segment(user_id),
        case_segment,
        sanitize_segment(evidence_id),
        sanitize_segment(filename)
    )
}

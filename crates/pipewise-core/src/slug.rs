// ABOUTME: Name sanitizing for orchestration backends with strict naming rules.
// ABOUTME: Turns a logical worker name into a container-safe slug.

/// Slug used when a name has no usable characters.
const FALLBACK_SLUG: &str = "worker";

/// Lowercase `value` and collapse every run of characters outside
/// `[a-z0-9_.-]` into a single `-`.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for ch in value.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }

    let trimmed = slug.trim_matches(|c| matches!(c, '-' | '.' | '_'));
    if trimmed.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        trimmed.to_string()
    }
}

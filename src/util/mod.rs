//! Small shared helpers.

/// Truncate `text` to at most `max_len` bytes (on a char boundary) and append
/// `marker` if anything was cut.
pub(crate) fn truncate_with_marker(text: &mut String, max_len: usize, marker: &str) {
    if text.len() <= max_len {
        return;
    }
    let mut cut = max_len;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(marker);
}

/// Derive a session title from the first user message.
pub(crate) fn generate_title(first_message: &str) -> String {
    let mut title = first_message.trim().to_string();
    truncate_with_marker(&mut title, 80, "...");
    title
}

/// Resolve values of the form `${NAME}` from the ambient environment.
/// Anything else passes through unchanged; an unset variable resolves to "".
pub(crate) fn expand_env(value: &str) -> String {
    match value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        Some(name) => std::env::var(name).unwrap_or_default(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_noop_under_limit() {
        let mut s = "short".to_string();
        truncate_with_marker(&mut s, 80, "...");
        assert_eq!(s, "short");
    }

    #[test]
    fn truncate_appends_marker() {
        let mut s = "a".repeat(100);
        truncate_with_marker(&mut s, 80, "...");
        assert_eq!(s.len(), 83);
        assert!(s.ends_with("..."));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let mut s = "é".repeat(50); // 2 bytes each
        truncate_with_marker(&mut s, 81, "...");
        assert!(s.ends_with("..."));
        assert!(s.starts_with('é'));
    }

    #[test]
    fn title_is_trimmed_and_capped() {
        assert_eq!(generate_title("  hello  "), "hello");
        let long = "x".repeat(120);
        let title = generate_title(&long);
        assert_eq!(title.len(), 83);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn expand_env_resolves_placeholder() {
        std::env::set_var("FORGE_TEST_EXPAND", "secret");
        assert_eq!(expand_env("${FORGE_TEST_EXPAND}"), "secret");
        assert_eq!(expand_env("${FORGE_TEST_UNSET_VAR}"), "");
        assert_eq!(expand_env("literal"), "literal");
    }
}

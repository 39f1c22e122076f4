/// Truncate a string to at most `max_chars` characters, ellipsis included.
/// Always cuts on a char boundary.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let truncated: String = input.chars().take(max_chars - 1).collect();
    format!("{truncated}…")
}

/// Marker appended when captured tool or pod output is cut short.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Truncate captured output to at most `max_bytes`, respecting UTF-8
/// boundaries, and append [`TRUNCATION_MARKER`] when anything was dropped.
pub fn truncate_output(mut output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }
    let mut cut = max_bytes;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str(TRUNCATION_MARKER);
    output
}

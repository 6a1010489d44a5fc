//! Think-block extraction for LLM responses.
//!
//! Reasoning models (DeepSeek R1 style) wrap their chain-of-thought in
//! `<think>...</think>` before the actual answer. [`extract_thinking`]
//! splits the two apart so a model's `reasoning` and `content` are reported
//! separately rather than concatenated.

/// Extract a `<think>...</think>` block from a response.
///
/// Returns `(thinking_content, cleaned_text)` where `cleaned_text` has the
/// thinking block removed and is trimmed.
pub fn extract_thinking(text: &str) -> (Option<String>, String) {
    let think_start = "<think>";
    let think_end = "</think>";

    if let Some(start_idx) = text.find(think_start) {
        if let Some(end_idx) = text.find(think_end) {
            let thinking = text[start_idx + think_start.len()..end_idx]
                .trim()
                .to_string();
            let mut cleaned = String::new();
            cleaned.push_str(&text[..start_idx]);
            cleaned.push_str(&text[end_idx + think_end.len()..]);
            let cleaned = cleaned.trim().to_string();
            let thinking = if thinking.is_empty() { None } else { Some(thinking) };
            return (thinking, cleaned);
        }
    }

    (None, text.to_string())
}

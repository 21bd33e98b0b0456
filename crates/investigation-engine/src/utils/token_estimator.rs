/// Token estimation for context budgeting.
/// Uses the coarse chars/4 rule; budgets are estimates, not tokenizer counts.

const CHARS_PER_TOKEN: usize = 4;

/// Estimate tokens from text length (characters, not bytes)
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

/// Estimate tokens for multiple chunks
pub fn estimate_chunks_tokens<S: AsRef<str>>(chunks: &[S]) -> usize {
    chunks.iter().map(|c| estimate_tokens(c.as_ref())).sum()
}

/// Check if adding text would exceed limit
pub fn would_exceed_limit(current_tokens: usize, new_text: &str, max_tokens: usize) -> bool {
    current_tokens + estimate_tokens(new_text) > max_tokens
}

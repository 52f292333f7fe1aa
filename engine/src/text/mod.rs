//! Query text canonicalization
//!
//! Two phrasings that differ only in case, spacing or trailing punctuation
//! share one cache entry. Canonicalization must never change meaning, so it
//! leaves inner punctuation, quotes and label values alone.

/// Characters stripped from the end of a query
const TRAILING_PUNCTUATION: &[char] = &['?', '!', '.', ';'];

/// Normalize a natural-language query for lookup and storage.
///
/// - Unicode lowercase
/// - whitespace runs (spaces, tabs, newlines) collapse to one space
/// - leading/trailing whitespace and trailing `? ! . ;` removed
pub fn canonicalize(query: &str) -> String {
    let lowered = query.to_lowercase();
    let mut collapsed = String::with_capacity(lowered.len());
    for word in lowered.split_whitespace() {
        if !collapsed.is_empty() {
            collapsed.push(' ');
        }
        collapsed.push_str(word);
    }

    collapsed
        .trim_end_matches(|c: char| TRAILING_PUNCTUATION.contains(&c) || c.is_whitespace())
        .to_string()
}

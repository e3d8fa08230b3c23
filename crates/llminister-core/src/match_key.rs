//! Match key normalisation for question text.
//!
//! Every extraction run assigns fresh ids, so ids cannot identify a question
//! across runs. Reconciliation instead matches on the question text after
//! normalisation:
//!
//! - leading and trailing whitespace removed
//! - every internal run of whitespace (spaces, tabs, newlines, NBSP) collapsed
//!   to a single ASCII space
//!
//! Case and punctuation are kept: "Wat is X?" and "wat is x" are different
//! questions.

/// Normalise question text into its reconciliation match key.
///
/// Returns an empty string for text that is empty or only whitespace; callers
/// treat that as a malformed record.
pub fn normalize_question(text: &str) -> String {
    let mut key = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !key.is_empty() {
            key.push(' ');
        }
        key.push_str(word);
    }
    key
}

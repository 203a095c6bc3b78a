//! Stateful per-tick operators.
//!
//! Operators here are plain functions over an explicit state value:
//! the scheduler hands in the state from the previous tick plus the
//! tick's lines and gets back the new state and what to emit. Nothing
//! is kept in ambient globals, so resuming from a checkpoint is just
//! handing in a restored state instead of an empty one.

pub mod word_count;

pub use word_count::AggregationState;
pub use word_count::Snapshot;
pub use word_count::WordCount;

/// Split a line into tokens on whitespace; empty tokens are never
/// produced.
pub(crate) fn tokens(line: &str) -> impl Iterator<Item = &str> {
    line.split_whitespace()
}

#[test]
fn tokens_skip_empty() {
    let found: Vec<&str> = tokens("  a\tb   a \n").collect();
    assert_eq!(found, vec!["a", "b", "a"]);
    assert_eq!(tokens("   ").count(), 0);
}

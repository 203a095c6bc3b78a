//! Running word count.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use super::tokens;

/// Cumulative count per token across the whole stream.
///
/// Counts only ever increase and there is no eviction. A [`BTreeMap`]
/// so the serialized form in a checkpoint is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationState {
    counts: BTreeMap<String, u64>,
    /// Total stop-word tokens filtered so far.
    dropped: u64,
}

impl AggregationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, token: &str) -> Option<u64> {
        self.counts.get(token).copied()
    }

    pub fn counts(&self) -> &BTreeMap<String, u64> {
        &self.counts
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for AggregationState {
    fn from_iter<T: IntoIterator<Item = (S, u64)>>(iter: T) -> Self {
        Self {
            counts: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            dropped: 0,
        }
    }
}

/// The tokens touched during one tick with their cumulative counts,
/// in order of first appearance within the tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot(Vec<(String, u64)>);

impl Snapshot {
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(token, count)| (token.as_str(), *count))
    }

    pub fn get(&self, token: &str) -> Option<u64> {
        self.iter().find(|(t, _)| *t == token).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (S, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Renders as `[a: 2, b: 1]`.
impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (token, count)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{token}: {count}")?;
        }
        f.write_str("]")
    }
}

/// Word count aggregation logic.
///
/// Tokens in `stop_words` are filtered out before counting and only
/// tallied in [`AggregationState::dropped`].
#[derive(Debug, Clone, Default)]
pub struct WordCount {
    stop_words: BTreeSet<String>,
}

impl WordCount {
    pub fn new(stop_words: BTreeSet<String>) -> Self {
        Self { stop_words }
    }

    /// Fold one tick's lines into the state.
    ///
    /// Deterministic: the same `state` and `lines` always produce the
    /// same new state and snapshot.
    pub fn apply(
        &self,
        mut state: AggregationState,
        lines: &[String],
    ) -> (AggregationState, Snapshot) {
        let mut touched: Vec<&str> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();

        for token in lines.iter().flat_map(|line| tokens(line)) {
            if self.stop_words.contains(token) {
                state.dropped += 1;
                continue;
            }
            *state.counts.entry(token.to_string()).or_insert(0) += 1;
            if seen.insert(token) {
                touched.push(token);
            }
        }

        let snapshot = touched
            .into_iter()
            .map(|token| {
                let count = state.counts.get(token).copied().unwrap_or_default();
                (token.to_string(), count)
            })
            .collect();

        (state, snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn two_ticks() {
        let logic = WordCount::default();

        let (state, snap1) = logic.apply(AggregationState::new(), &lines(&["a b a"]));
        assert_eq!(snap1, Snapshot::from_iter([("a", 2), ("b", 1)]));

        let (state, snap2) = logic.apply(state, &lines(&["b c"]));
        assert_eq!(snap2, Snapshot::from_iter([("b", 2), ("c", 1)]));

        assert_eq!(
            state,
            AggregationState::from_iter([("a", 2), ("b", 2), ("c", 1)])
        );
    }

    #[test]
    fn empty_tick_is_valid() {
        let logic = WordCount::default();
        let before = AggregationState::from_iter([("a", 3)]);

        let (after, snap) = logic.apply(before.clone(), &[]);
        assert!(snap.is_empty());
        assert_eq!(snap.to_string(), "[]");
        assert_eq!(after, before);

        let (after, snap) = logic.apply(before.clone(), &lines(&["", "   "]));
        assert!(snap.is_empty());
        assert_eq!(after, before);
    }

    #[test]
    fn snapshot_order_is_first_appearance() {
        let logic = WordCount::default();
        let (_, snap) = logic.apply(AggregationState::new(), &lines(&["z y", "x z", "y"]));
        let order: Vec<&str> = snap.iter().map(|(t, _)| t).collect();
        assert_eq!(order, vec!["z", "y", "x"]);
        assert_eq!(snap.to_string(), "[z: 2, y: 2, x: 1]");
    }

    #[test]
    fn counts_never_decrease() {
        let logic = WordCount::default();
        let batches = [
            lines(&["a b"]),
            lines(&[]),
            lines(&["b b c", "a"]),
            lines(&["d"]),
        ];

        let mut state = AggregationState::new();
        for batch in batches.iter() {
            let before = state.clone();
            let (after, _) = logic.apply(state, batch);
            for (token, count) in before.counts() {
                assert!(after.get(token).unwrap() >= *count);
            }
            state = after;
        }
        assert_eq!(
            state,
            AggregationState::from_iter([("a", 2), ("b", 3), ("c", 1), ("d", 1)])
        );
    }

    #[test]
    fn deterministic() {
        let logic = WordCount::default();
        let start = AggregationState::from_iter([("a", 1)]);
        let batch = lines(&["c a b", "b"]);

        let first = logic.apply(start.clone(), &batch);
        let second = logic.apply(start, &batch);
        assert_eq!(first, second);
    }

    #[test]
    fn stop_words_are_dropped() {
        let logic = WordCount::new(["the".to_string()].into_iter().collect());
        let (state, snap) =
            logic.apply(AggregationState::new(), &lines(&["the cat the hat"]));

        assert_eq!(snap, Snapshot::from_iter([("cat", 1), ("hat", 1)]));
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.get("cat"), Some(1));
        assert_eq!(snap.get("the"), None);
        assert_eq!(state.len(), 2);
        assert_eq!(state.get("the"), None);
        assert_eq!(state.dropped(), 2);

        let (state, _) = logic.apply(state, &lines(&["the"]));
        assert_eq!(state.dropped(), 3);
    }
}

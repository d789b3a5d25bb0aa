//! In-memory index over one project's mined patterns.
//!
//! Patterns are keyed by their event names joined with [`KEY_SEPARATOR`].
//! The index answers exact per-user counts, frequent-path listings and the
//! funnel/lift "factor" analysis built on the influence tree.

mod funnel;
mod influence;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::pattern::Pattern;
use crate::types::CardinalityBounds;

pub use funnel::{ALL_ACTIVE_USERS, FactorInsight, FactorReport, Funnel, FunnelStage, Impact};

/// Joins event names into an index key.
pub const KEY_SEPARATOR: &str = ",";

/// Errors raised while building or querying an index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A pattern breaks its count or layout invariants.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    /// The end event has no single-event pattern with a positive count.
    #[error("end event '{0}' has no frequent single-event pattern")]
    RootNotFound(String),
}

/// Tunables for the index queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Maximum entries returned by frequent-path and factor queries.
    pub top_n: usize,
    /// Children kept per influence-tree node.
    pub max_children: usize,
    /// Upper bound on influence-tree nodes evaluated per factor query.
    pub max_nodes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            top_n: 50,
            max_children: 100,
            max_nodes: 500,
        }
    }
}

/// A pattern ranked by its bounded per-user count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathCount {
    #[serde(rename = "eventNames")]
    pub event_names: Vec<String>,
    #[serde(rename = "perUserCount")]
    pub per_user_count: u64,
    pub count: u64,
    #[serde(rename = "userCount")]
    pub user_count: u64,
}

/// Canonical index key of an event sequence.
#[must_use]
pub fn pattern_key<S: AsRef<str>>(events: &[S]) -> String {
    let mut key = String::new();
    for (idx, event) in events.iter().enumerate() {
        if idx > 0 {
            key.push_str(KEY_SEPARATOR);
        }
        key.push_str(event.as_ref());
    }
    key
}

/// Read-only index of one project's patterns.
#[derive(Debug, Clone)]
pub struct PatternIndex {
    patterns: Vec<Pattern>,
    by_key: HashMap<String, usize>,
    by_end: HashMap<String, Vec<usize>>,
    config: IndexConfig,
}

impl PatternIndex {
    /// Index the given patterns. Invalid patterns fail the build; repeated
    /// sequences keep the first occurrence.
    pub fn build(patterns: impl IntoIterator<Item = Pattern>, config: IndexConfig) -> Result<Self, IndexError> {
        let mut index = Self {
            patterns: Vec::new(),
            by_key: HashMap::new(),
            by_end: HashMap::new(),
            config,
        };
        for pattern in patterns {
            pattern.validate().map_err(IndexError::InvalidPattern)?;
            let key = pattern_key(&pattern.event_names);
            if index.by_key.contains_key(&key) {
                warn!(pattern = %key, "duplicate pattern ignored");
                continue;
            }
            let position = index.patterns.len();
            if let Some(end) = pattern.event_names.last() {
                index.by_end.entry(end.clone()).or_default().push(position);
            }
            index.by_key.insert(key, position);
            index.patterns.push(pattern);
        }
        Ok(index)
    }

    #[must_use]
    pub const fn config(&self) -> &IndexConfig {
        &self.config
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.iter()
    }

    /// Exact-sequence lookup.
    #[must_use]
    pub fn get<S: AsRef<str>>(&self, events: &[S]) -> Option<&Pattern> {
        self.by_key.get(&pattern_key(events)).map(|idx| &self.patterns[*idx])
    }

    /// Per-user count of an exact sequence, bounds applied to its final event.
    #[must_use]
    pub fn get_per_user_count<S: AsRef<str>>(&self, events: &[S], bounds: CardinalityBounds) -> Option<u64> {
        self.get(events).map(|pattern| pattern.per_user_count(bounds))
    }

    /// Total occurrences of an exact sequence.
    #[must_use]
    pub fn count_of<S: AsRef<str>>(&self, events: &[S]) -> Option<u64> {
        self.get(events).map(|pattern| pattern.count)
    }

    /// Occurrences summed over every single-event pattern.
    #[must_use]
    pub fn total_event_count(&self) -> u64 {
        self.patterns
            .iter()
            .filter(|pattern| pattern.len() == 1)
            .map(|pattern| pattern.count)
            .sum()
    }

    /// Patterns anchored at `start`/`end`; an empty anchor matches anything.
    pub fn anchored<'a>(&'a self, start: &'a str, end: &'a str) -> impl Iterator<Item = &'a Pattern> + 'a {
        self.patterns.iter().filter(move |pattern| {
            (start.is_empty() || pattern.event_names.first().is_some_and(|first| first == start))
                && (end.is_empty() || pattern.event_names.last().is_some_and(|last| last == end))
        })
    }

    /// Patterns that contain `event` anywhere in the sequence.
    pub fn containing<'a>(&'a self, event: &'a str) -> impl Iterator<Item = &'a Pattern> + 'a {
        self.patterns
            .iter()
            .filter(move |pattern| pattern.event_names.iter().any(|name| name == event))
    }

    /// Anchored patterns ranked by bounded per-user count, truncated to `top_n`.
    ///
    /// Ties are broken by event names so results are stable.
    #[must_use]
    pub fn frequent_paths(&self, start: &str, end: &str, bounds: CardinalityBounds) -> Vec<PathCount> {
        let mut paths: Vec<PathCount> = self
            .anchored(start, end)
            .map(|pattern| PathCount {
                event_names: pattern.event_names.clone(),
                per_user_count: pattern.per_user_count(bounds),
                count: pattern.count,
                user_count: pattern.user_count,
            })
            .collect();
        paths.sort_by(|a, b| {
            b.per_user_count
                .cmp(&a.per_user_count)
                .then_with(|| a.event_names.cmp(&b.event_names))
        });
        paths.truncate(self.config.top_n);
        paths
    }

    pub(crate) fn pattern_at(&self, idx: usize) -> &Pattern {
        &self.patterns[idx]
    }

    pub(crate) fn position_of<S: AsRef<str>>(&self, events: &[S]) -> Option<usize> {
        self.by_key.get(&pattern_key(events)).copied()
    }

    /// Positions of every pattern ending in `end`, in build order.
    pub(crate) fn ending_in(&self, end: &str) -> &[usize] {
        self.by_end.get(end).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::pattern::TransitionSample;

    pub(crate) fn pattern(events: &[&str], count: u64, user_count: u64, ouc: u64) -> Pattern {
        Pattern::new(events.iter().map(|e| (*e).to_string()).collect(), count, user_count, ouc)
    }

    /// Patterns ending in `y` with a two-level influence tree.
    pub(crate) fn factor_index() -> PatternIndex {
        PatternIndex::build(
            vec![
                pattern(&["y"], 150, 100, 20),
                pattern(&["a"], 60, 40, 30),
                pattern(&["b"], 80, 60, 50),
                pattern(&["c"], 20, 12, 1),
                pattern(&["a", "b"], 12, 11, 10),
                pattern(&["a", "y"], 20, 18, 15),
                pattern(&["b", "y"], 6, 5, 4),
                pattern(&["c", "y"], 3, 2, 2),
                pattern(&["a", "b", "y"], 10, 9, 9),
            ],
            IndexConfig::default(),
        )
        .unwrap()
    }

    fn index() -> PatternIndex {
        PatternIndex::build(
            vec![
                pattern(&["a"], 100, 80, 60),
                pattern(&["b"], 90, 80, 50),
                pattern(&["a", "b"], 40, 35, 30),
                pattern(&["b", "a"], 20, 20, 20),
                pattern(&["a", "c", "b"], 15, 12, 10).with_transitions(vec![
                    vec![],
                    vec![
                        TransitionSample { cardinality: 1, repeats: 1, gap_secs: 5 },
                        TransitionSample { cardinality: 4, repeats: 1, gap_secs: 5 },
                    ],
                ]),
            ],
            IndexConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn every_pattern_reports_its_once_per_user_count() {
        let index = index();
        for pattern in index.patterns() {
            assert_eq!(
                index.get_per_user_count(&pattern.event_names, CardinalityBounds::UNBOUNDED),
                Some(pattern.once_per_user_count)
            );
        }
        assert_eq!(index.get_per_user_count(&["z"], CardinalityBounds::UNBOUNDED), None);
    }

    #[test]
    fn bounds_apply_to_the_final_event() {
        let index = index();
        assert_eq!(index.get_per_user_count(&["a", "c", "b"], CardinalityBounds::new(1, 2)), Some(5));
    }

    #[test]
    fn frequent_paths_filter_sort_and_truncate() {
        let index = index();
        let ending_in_b = index.frequent_paths("", "b", CardinalityBounds::UNBOUNDED);
        let keys: Vec<_> = ending_in_b.iter().map(|p| pattern_key(&p.event_names)).collect();
        assert_eq!(keys, vec!["b", "a,b", "a,c,b"]);

        let from_a = index.frequent_paths("a", "", CardinalityBounds::UNBOUNDED);
        assert_eq!(from_a.first().unwrap().event_names, vec!["a"]);
        assert_eq!(from_a.len(), 3);

        let mut config = IndexConfig::default();
        config.top_n = 2;
        let small = PatternIndex::build(index.patterns().cloned(), config).unwrap();
        assert_eq!(small.frequent_paths("", "", CardinalityBounds::UNBOUNDED).len(), 2);
    }

    #[test]
    fn totals_and_containment() {
        let index = index();
        assert_eq!(index.total_event_count(), 190);
        assert_eq!(index.count_of(&["b", "a"]), Some(20));
        assert_eq!(index.containing("c").count(), 1);
    }

    #[test]
    fn invalid_pattern_fails_the_build() {
        let err = PatternIndex::build(vec![pattern(&["a"], 1, 5, 2)], IndexConfig::default()).unwrap_err();
        assert!(matches!(err, IndexError::InvalidPattern(_)));
    }

    #[test]
    fn duplicates_keep_the_first_pattern() {
        let index = PatternIndex::build(
            vec![pattern(&["a"], 10, 10, 5), pattern(&["a"], 20, 20, 9)],
            IndexConfig::default(),
        )
        .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.count_of(&["a"]), Some(10));
    }
}

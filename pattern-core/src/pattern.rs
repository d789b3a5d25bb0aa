//! Mined behavioral patterns and the per-model event metadata stored next to them.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::CardinalityBounds;

/// One observation of the transition between two adjacent events of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionSample {
    /// How many times the later event occurred for the user.
    #[serde(rename = "card")]
    pub cardinality: u64,
    /// How many times the pair repeated.
    #[serde(rename = "rep", default)]
    pub repeats: u64,
    /// Seconds between the two events.
    #[serde(rename = "gap", default)]
    pub gap_secs: u64,
}

/// An ordered event-name sequence plus its mined aggregate statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    /// Event names in sequence order.
    #[serde(rename = "en")]
    pub event_names: Vec<String>,
    /// Occurrences, counted several times per user.
    #[serde(rename = "c")]
    pub count: u64,
    /// Users the pattern was counted over.
    #[serde(rename = "uc")]
    pub user_count: u64,
    /// Users for whom the sequence occurred at least once.
    #[serde(rename = "ouc")]
    pub once_per_user_count: u64,
    /// Samples for each adjacent event pair, `transitions[i]` covering
    /// `event_names[i] -> event_names[i + 1]`.
    #[serde(rename = "ts", default)]
    pub transitions: Vec<Vec<TransitionSample>>,
}

impl Pattern {
    /// Pattern without transition samples.
    #[must_use]
    pub fn new(event_names: Vec<String>, count: u64, user_count: u64, once_per_user_count: u64) -> Self {
        Self {
            event_names,
            count,
            user_count,
            once_per_user_count,
            transitions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_transitions(mut self, transitions: Vec<Vec<TransitionSample>>) -> Self {
        self.transitions = transitions;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.event_names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event_names.is_empty()
    }

    /// Checks `once_per_user_count <= user_count <= count` and the sample layout.
    pub fn validate(&self) -> Result<(), String> {
        if self.event_names.is_empty() {
            return Err("pattern has no events".to_string());
        }
        if self.once_per_user_count > self.user_count || self.user_count > self.count {
            return Err(format!(
                "pattern {:?} breaks ouc <= uc <= c ({} / {} / {})",
                self.event_names, self.once_per_user_count, self.user_count, self.count
            ));
        }
        if self.transitions.len() >= self.event_names.len() {
            return Err(format!(
                "pattern {:?} has {} transitions for {} events",
                self.event_names,
                self.transitions.len(),
                self.event_names.len()
            ));
        }
        Ok(())
    }

    /// Per-user count with the occurrence bounds applied to the final event.
    ///
    /// The share of final-transition samples inside `bounds` scales the
    /// once-per-user count. Without bounds, or without samples for the final
    /// transition, the mined count is returned unchanged.
    #[must_use]
    pub fn per_user_count(&self, bounds: CardinalityBounds) -> u64 {
        if bounds.is_unbounded() || self.event_names.len() < 2 {
            return self.once_per_user_count;
        }
        let Some(samples) = self.transitions.get(self.event_names.len() - 2) else {
            return self.once_per_user_count;
        };
        if samples.is_empty() {
            return self.once_per_user_count;
        }
        let total = samples.len() as u128;
        let matching = samples
            .iter()
            .filter(|sample| bounds.contains(sample.cardinality))
            .count() as u128;
        let scaled = (u128::from(self.once_per_user_count) * matching + total / 2) / total;
        u64::try_from(scaled).unwrap_or(self.once_per_user_count)
    }
}

/// One line of a chunk blob: the indexed event names plus the full pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRecord {
    #[serde(rename = "pe")]
    pub event_names: Vec<String>,
    #[serde(rename = "rp")]
    pub pattern: Pattern,
}

impl From<Pattern> for PatternRecord {
    fn from(pattern: Pattern) -> Self {
        Self {
            event_names: pattern.event_names.clone(),
            pattern,
        }
    }
}

/// Known property keys for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertiesInfo {
    /// Property names carrying numbers.
    #[serde(rename = "numeric")]
    pub numeric_keys: BTreeSet<String>,
    /// Property names carrying categories, with the values seen for each.
    #[serde(rename = "categorical")]
    pub categorical_values: BTreeMap<String, BTreeSet<String>>,
}

/// Metadata for one event name of a model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventInfo {
    pub properties: PropertiesInfo,
}

/// Per-model property catalog for users and every mined event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAndEventsInfo {
    #[serde(rename = "userProperties")]
    pub user_properties: PropertiesInfo,
    #[serde(rename = "eventProperties")]
    pub events: HashMap<String, EventInfo>,
    #[serde(rename = "modelVersion")]
    pub model_version: u32,
}

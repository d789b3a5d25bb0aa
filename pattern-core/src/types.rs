//! Identifier aliases and the cardinality range shared by index queries.

use serde::{Deserialize, Serialize};

/// Tenant identifier.
pub type ProjectId = i64;

/// Identifier of one mined model of a project.
pub type ModelId = u64;

/// Occurrence-count filter applied to the final event of a sequence.
///
/// `lower` is inclusive, `upper` exclusive. The full `0..u64::MAX` range is
/// treated as "no filter" so exact mined counts are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CardinalityBounds {
    /// Smallest accepted occurrence count.
    #[serde(rename = "lowerBound", default)]
    pub lower: u64,
    /// First rejected occurrence count.
    #[serde(rename = "upperBound", default = "unbounded_upper")]
    pub upper: u64,
}

const fn unbounded_upper() -> u64 {
    u64::MAX
}

impl CardinalityBounds {
    /// The range that filters nothing.
    pub const UNBOUNDED: Self = Self {
        lower: 0,
        upper: u64::MAX,
    };

    #[must_use]
    pub const fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }

    #[must_use]
    pub const fn is_unbounded(&self) -> bool {
        self.lower == 0 && self.upper == u64::MAX
    }

    /// Whether an occurrence count falls inside the range.
    #[must_use]
    pub const fn contains(&self, cardinality: u64) -> bool {
        cardinality >= self.lower && (cardinality < self.upper || self.upper == u64::MAX)
    }
}

impl Default for CardinalityBounds {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn bounds_are_half_open() {
        let bounds = CardinalityBounds::new(2, 4);
        assert!(!bounds.contains(1));
        assert!(bounds.contains(2));
        assert!(bounds.contains(3));
        assert!(!bounds.contains(4));
        assert!(!bounds.is_unbounded());
    }

    #[test]
    fn default_is_unbounded() {
        let bounds = CardinalityBounds::default();
        assert!(bounds.is_unbounded());
        assert!(bounds.contains(u64::MAX));
    }

    #[test]
    fn missing_upper_bound_deserializes_as_unbounded() {
        let bounds: CardinalityBounds = serde_json::from_str(r#"{"lowerBound":0}"#).unwrap();
        assert!(bounds.is_unbounded());
    }
}

//! Funnel and lift comparison for every node of the influence tree.

use serde::Serialize;
use tracing::warn;

use super::influence::{InfluenceNode, InfluenceTree};
use super::{IndexError, PatternIndex};
use crate::types::CardinalityBounds;

/// Pseudo event naming the reference stage of short funnels.
pub const ALL_ACTIVE_USERS: &str = "$AllActiveUsers";

/// One step of a funnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunnelStage {
    pub event: String,
    pub count: u64,
    /// Users of the first stage that did not reach this one.
    pub dropoff: u64,
}

/// Ordered stages with the conversion between the final two.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Funnel {
    pub stages: Vec<FunnelStage>,
    #[serde(rename = "conversionPercent")]
    pub conversion_percent: f64,
}

impl Funnel {
    fn from_counts(events: Vec<String>, counts: Vec<u64>) -> Self {
        let reference = counts.first().copied().unwrap_or(0);
        let stages: Vec<FunnelStage> = events
            .into_iter()
            .zip(counts)
            .map(|(event, count)| FunnelStage {
                event,
                count,
                dropoff: reference.saturating_sub(count),
            })
            .collect();
        let conversion_percent = match stages.as_slice() {
            [.., before, last] => conversion_percent(before.count, last.count),
            _ => 0.0,
        };
        Self {
            stages,
            conversion_percent,
        }
    }
}

/// `100 × last / before`, one decimal when above 0.1; 0 without a denominator.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn conversion_percent(before: u64, last: u64) -> f64 {
    if before == 0 {
        return 0.0;
    }
    let percent = last as f64 * 100.0 / before as f64;
    if percent > 0.1 {
        (percent * 10.0).round() / 10.0
    } else {
        percent
    }
}

/// Direction of a candidate's conversion against its base funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Positive,
    Negative,
    Neutral,
}

/// Funnel comparison for one influence-tree candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactorInsight {
    pub events: Vec<String>,
    pub header: String,
    pub impact: Impact,
    /// Candidate conversion over base conversion, absent when the base never converts.
    pub lift: Option<f64>,
    #[serde(rename = "giniDrop")]
    pub gini_drop: f64,
    pub funnel: Funnel,
    #[serde(rename = "baseFunnel")]
    pub base_funnel: Funnel,
}

/// Result of a factor query, in influence-tree traversal order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactorReport {
    #[serde(rename = "endEvent")]
    pub end_event: String,
    #[serde(rename = "totalUsers")]
    pub total_users: u64,
    pub insights: Vec<FactorInsight>,
}

impl PatternIndex {
    /// Compare every sequence leading to `end` with the same sequence minus
    /// its last inserted event.
    pub fn factor(&self, end: &str, bounds: CardinalityBounds) -> Result<FactorReport, IndexError> {
        let tree = InfluenceTree::build(self, end, bounds)?;
        let total_users = tree.nodes[0].prefix;
        let insights = tree
            .nodes
            .iter()
            .filter_map(|node| {
                let parent = node.parent.map(|id| &tree.nodes[id])?;
                Some(self.insight(node, parent, bounds, total_users))
            })
            .take(self.config().top_n)
            .collect();
        Ok(FactorReport {
            end_event: end.to_string(),
            total_users,
            insights,
        })
    }

    fn insight(
        &self,
        node: &InfluenceNode,
        parent: &InfluenceNode,
        bounds: CardinalityBounds,
        total_users: u64,
    ) -> FactorInsight {
        let events = &self.pattern_at(node.pattern).event_names;
        let base_events = &self.pattern_at(parent.pattern).event_names;
        let with_reference = events.len() == 2;

        let funnel = self.funnel(events, bounds, with_reference, total_users);
        let base_funnel = self.funnel(base_events, bounds, with_reference, total_users);
        let (impact, lift) = compare(funnel.conversion_percent, base_funnel.conversion_percent);

        FactorInsight {
            events: events.clone(),
            header: header(events, impact, funnel.conversion_percent, base_funnel.conversion_percent),
            impact,
            lift,
            gini_drop: node.gini_drop,
            funnel,
            base_funnel,
        }
    }

    /// Per-user counts of every prefix of `events`, the final one bounded.
    ///
    /// A prefix missing from the index falls back to the final count. Counts
    /// are clamped so the funnel never widens.
    fn funnel(&self, events: &[String], bounds: CardinalityBounds, with_reference: bool, total_users: u64) -> Funnel {
        let len = events.len();
        let final_count = self.get_per_user_count(events, bounds).unwrap_or(0);
        let mut names = Vec::with_capacity(len + 1);
        let mut counts = Vec::with_capacity(len + 1);
        if with_reference {
            names.push(ALL_ACTIVE_USERS.to_string());
            counts.push(total_users);
        }

        for i in 0..len {
            let count = if i == len - 1 {
                final_count
            } else {
                self.get_per_user_count(&events[..=i], CardinalityBounds::UNBOUNDED)
                    .unwrap_or_else(|| {
                        warn!(
                            subsequence = ?&events[..=i],
                            sequence = ?events,
                            "subsequence not as frequent as sequence"
                        );
                        final_count
                    })
            };
            let count = match counts.last() {
                Some(previous) if count > *previous => {
                    warn!(sequence = ?events, stage = i, count, previous, "funnel stage wider than the one before, clamping");
                    *previous
                }
                _ => count,
            };
            names.push(events[i].clone());
            counts.push(count);
        }
        Funnel::from_counts(names, counts)
    }
}

fn compare(candidate: f64, base: f64) -> (Impact, Option<f64>) {
    let lift = (base > 0.0).then(|| candidate / base);
    let impact = if candidate > base {
        Impact::Positive
    } else if candidate < base {
        Impact::Negative
    } else {
        Impact::Neutral
    };
    (impact, lift)
}

fn header(events: &[String], impact: Impact, candidate: f64, base: f64) -> String {
    let len = events.len();
    let end = &events[len - 1];
    let impact_event = &events[len - 2];
    let others = if len > 2 {
        format!(" after {}", events[..len - 2].join(" and "))
    } else {
        String::new()
    };
    let change = match impact {
        Impact::Positive if base > 0.0 => format!("{:.1} times higher chance to", candidate / base),
        Impact::Positive => "a higher chance to".to_string(),
        Impact::Negative if candidate > 0.0 => format!("{:.2} times lower chance to", base / candidate),
        Impact::Negative => "a lower chance to".to_string(),
        Impact::Neutral => "the same chance to".to_string(),
    };
    format!("Users who have {impact_event}{others}, have {change} {end}.")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::index::IndexConfig;
    use crate::index::tests::{factor_index, pattern};
    use crate::pattern::Pattern;
    use proptest::prelude::*;

    #[test]
    fn conversion_rounds_above_a_tenth() {
        assert!((conversion_percent(3, 1) - 33.3).abs() < 1e-9);
        assert!((conversion_percent(0, 5) - 0.0).abs() < f64::EPSILON);
        assert!((conversion_percent(10_000, 5) - 0.05).abs() < 1e-12);
        assert!((conversion_percent(8, 8) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn factor_compares_candidates_with_their_base() {
        let report = factor_index().factor("y", CardinalityBounds::UNBOUNDED).unwrap();
        assert_eq!(report.total_users, 100);
        let order: Vec<_> = report.insights.iter().map(|i| i.events.join(",")).collect();
        assert_eq!(order, vec!["a,y", "b,y", "a,b,y"]);

        let a_y = &report.insights[0];
        let stages: Vec<_> = a_y.funnel.stages.iter().map(|s| (s.event.as_str(), s.count)).collect();
        assert_eq!(stages, vec![(ALL_ACTIVE_USERS, 100), ("a", 30), ("y", 15)]);
        let base: Vec<_> = a_y.base_funnel.stages.iter().map(|s| (s.event.as_str(), s.count)).collect();
        assert_eq!(base, vec![(ALL_ACTIVE_USERS, 100), ("y", 20)]);
        assert!((a_y.funnel.conversion_percent - 50.0).abs() < f64::EPSILON);
        assert!((a_y.base_funnel.conversion_percent - 20.0).abs() < f64::EPSILON);
        assert_eq!(a_y.impact, Impact::Positive);
        assert!((a_y.lift.unwrap() - 2.5).abs() < 1e-9);
        assert_eq!(a_y.header, "Users who have a, have 2.5 times higher chance to y.");

        let b_y = &report.insights[1];
        assert_eq!(b_y.impact, Impact::Negative);
        assert_eq!(b_y.header, "Users who have b, have 2.50 times lower chance to y.");

        let a_b_y = &report.insights[2];
        let stages: Vec<_> = a_b_y.funnel.stages.iter().map(|s| s.count).collect();
        assert_eq!(stages, vec![30, 10, 9]);
        let base: Vec<_> = a_b_y.base_funnel.stages.iter().map(|s| s.count).collect();
        assert_eq!(base, vec![30, 15]);
        assert_eq!(a_b_y.header, "Users who have b after a, have 1.8 times higher chance to y.");
    }

    #[test]
    fn output_is_capped_in_traversal_order() {
        let index = PatternIndex::build(
            factor_index().patterns().cloned(),
            IndexConfig {
                top_n: 1,
                ..IndexConfig::default()
            },
        )
        .unwrap();
        let report = index.factor("y", CardinalityBounds::UNBOUNDED).unwrap();
        assert_eq!(report.insights.len(), 1);
        assert_eq!(report.insights[0].events, vec!["a", "y"]);
    }

    #[test]
    fn missing_prefix_falls_back_to_final_count() {
        let index = PatternIndex::build(
            vec![
                pattern(&["y"], 100, 100, 40),
                pattern(&["a", "b"], 30, 25, 20),
                pattern(&["a", "b", "y"], 10, 8, 8),
            ],
            IndexConfig::default(),
        )
        .unwrap();
        let funnel = index.funnel(
            &["a".to_string(), "b".to_string(), "y".to_string()],
            CardinalityBounds::UNBOUNDED,
            false,
            100,
        );
        let counts: Vec<_> = funnel.stages.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![8, 8, 8]);
        assert!((funnel.conversion_percent - 100.0).abs() < f64::EPSILON);
    }

    fn arbitrary_patterns() -> impl Strategy<Value = Vec<Pattern>> {
        let events = prop::collection::vec(prop::sample::select(vec!["a", "b", "c", "y"]), 1..4);
        let counts = (0u64..200, 0u64..200, 0u64..200);
        prop::collection::vec((events, counts), 1..40).prop_map(|entries| {
            entries
                .into_iter()
                .map(|(events, (x, y, z))| {
                    let mut sorted = [x, y, z];
                    sorted.sort_unstable();
                    pattern(&events, sorted[2], sorted[1], sorted[0])
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn funnels_never_widen(patterns in arbitrary_patterns()) {
            let index = PatternIndex::build(patterns, IndexConfig::default()).unwrap();
            let Ok(report) = index.factor("y", CardinalityBounds::UNBOUNDED) else {
                return Ok(());
            };
            for insight in &report.insights {
                for funnel in [&insight.funnel, &insight.base_funnel] {
                    prop_assert!((0.0..=100.0).contains(&funnel.conversion_percent));
                    for pair in funnel.stages.windows(2) {
                        prop_assert!(pair[1].count <= pair[0].count);
                    }
                }
            }
        }
    }
}

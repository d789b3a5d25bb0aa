//! Influence tree over sequences that end in the same event.
//!
//! Nodes live in an arena and are expanded breadth first, so the traversal
//! order (and everything truncated from it) is deterministic.

use std::collections::VecDeque;

use tracing::debug;

use super::{IndexError, PatternIndex};
use crate::types::CardinalityBounds;

#[derive(Debug, Clone)]
pub(crate) struct InfluenceNode {
    /// Position of the node's pattern in the index.
    pub(crate) pattern: usize,
    /// Arena id of the parent; `None` only for the root.
    pub(crate) parent: Option<usize>,
    /// Bounded per-user count of the full sequence.
    pub(crate) reached: u64,
    /// Per-user count of the sequence without its end event.
    pub(crate) prefix: u64,
    /// Impurity of reaching the end event from the prefix.
    pub(crate) right_gini: f64,
    pub(crate) gini_drop: f64,
}

pub(crate) struct InfluenceTree {
    pub(crate) nodes: Vec<InfluenceNode>,
}

const fn gini(p: f64) -> f64 {
    p * (1.0 - p)
}

#[allow(clippy::cast_precision_loss)]
const fn ratio(numerator: u64, denominator: u64) -> f64 {
    numerator as f64 / denominator as f64
}

/// `child` is `parent` with exactly one event inserted right before the shared
/// end event. Inserting the end event itself does not count.
pub(crate) fn is_child_sequence(parent: &[String], child: &[String]) -> bool {
    let (p_len, c_len) = (parent.len(), child.len());
    if p_len == 0 || c_len != p_len + 1 {
        return false;
    }
    child[..c_len - 2] == parent[..p_len - 1]
        && child[c_len - 1] == parent[p_len - 1]
        && child[c_len - 2] != child[c_len - 1]
}

impl InfluenceTree {
    pub(crate) fn build(index: &PatternIndex, end: &str, bounds: CardinalityBounds) -> Result<Self, IndexError> {
        let root_pos = index
            .position_of(&[end])
            .filter(|pos| index.pattern_at(*pos).count > 0)
            .ok_or_else(|| IndexError::RootNotFound(end.to_string()))?;
        let root = index.pattern_at(root_pos);
        let reached = root.per_user_count(bounds);
        let prefix = root.user_count;
        let right_gini = if prefix > 0 { gini(ratio(reached, prefix)) } else { 0.0 };

        let mut nodes = vec![InfluenceNode {
            pattern: root_pos,
            parent: None,
            reached,
            prefix,
            right_gini,
            gini_drop: 0.0,
        }];
        let max_nodes = index.config().max_nodes.max(1);
        let mut queue = VecDeque::from([0usize]);

        while let Some(parent_id) = queue.pop_front() {
            if nodes.len() >= max_nodes {
                break;
            }
            let children = expand(index, &nodes[parent_id], parent_id, end, bounds);
            for child in children {
                if nodes.len() >= max_nodes {
                    debug!(end, max_nodes, "influence tree node limit reached");
                    break;
                }
                queue.push_back(nodes.len());
                nodes.push(child);
            }
        }
        Ok(Self { nodes })
    }
}

/// Scored children of one node, best impurity drop first.
fn expand(
    index: &PatternIndex,
    parent: &InfluenceNode,
    parent_id: usize,
    end: &str,
    bounds: CardinalityBounds,
) -> Vec<InfluenceNode> {
    let parent_events = &index.pattern_at(parent.pattern).event_names;
    let (fpr, fpp) = (parent.reached, parent.prefix);
    let mut children = Vec::new();

    for &candidate in index.ending_in(end) {
        let pattern = index.pattern_at(candidate);
        let events = &pattern.event_names;
        if !is_child_sequence(parent_events, events) {
            continue;
        }
        let fcr = pattern.per_user_count(bounds);
        let Some(fcp) = index.get_per_user_count(&events[..events.len() - 1], CardinalityBounds::UNBOUNDED) else {
            debug!(candidate = ?events, "prefix of candidate not indexed");
            continue;
        };
        if fcp == 0 || fcr == 0 {
            continue;
        }
        if fpp < fpr || fcp < fcr || fpp < fcp || fpr < fcr {
            debug!(candidate = ?events, fpr, fpp, fcr, fcp, "inconsistent counts, skipping candidate");
            continue;
        }

        let right_gini = gini(ratio(fcr, fcp));
        let right_fraction = ratio(fcp, fpp);
        let (left_gini, left_fraction) = if fpp > fcp {
            (gini(ratio(fpr - fcr, fpp - fcp)), ratio(fpp - fcp, fpp))
        } else {
            (0.0, 0.0)
        };
        let overall = right_fraction.mul_add(right_gini, left_fraction * left_gini);

        children.push(InfluenceNode {
            pattern: candidate,
            parent: Some(parent_id),
            reached: fcr,
            prefix: fcp,
            right_gini,
            gini_drop: parent.right_gini - overall,
        });
    }

    children.sort_by(|a, b| b.gini_drop.total_cmp(&a.gini_drop));
    children.truncate(index.config().max_children);
    children.retain(|child| child.gini_drop > 0.0);
    children
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::index::IndexConfig;
    use crate::index::tests::factor_index as sample_index;

    fn names(events: &[&str]) -> Vec<String> {
        events.iter().map(|e| (*e).to_string()).collect()
    }

    #[test]
    fn child_sequence_inserts_before_the_end() {
        assert!(is_child_sequence(&names(&["y"]), &names(&["a", "y"])));
        assert!(is_child_sequence(&names(&["a", "y"]), &names(&["a", "b", "y"])));
        assert!(!is_child_sequence(&names(&["a", "y"]), &names(&["b", "a", "y"])));
        assert!(!is_child_sequence(&names(&["a", "y"]), &names(&["a", "y", "y"])));
        assert!(!is_child_sequence(&names(&["y"]), &names(&["y", "y"])));
        assert!(!is_child_sequence(&names(&["y"]), &names(&["a", "b", "y"])));
    }

    #[test]
    fn breadth_first_order_by_impurity_drop() {
        let index = sample_index();
        let tree = InfluenceTree::build(&index, "y", CardinalityBounds::UNBOUNDED).unwrap();
        let order: Vec<_> = tree
            .nodes
            .iter()
            .map(|node| index.pattern_at(node.pattern).event_names.join(","))
            .collect();
        // c,y reaches more users than its prefix and is skipped.
        assert_eq!(order, vec!["y", "a,y", "b,y", "a,b,y"]);
        assert_eq!(tree.nodes[3].parent, Some(1));
        assert!(tree.nodes.iter().skip(1).all(|node| node.gini_drop > 0.0));
    }

    #[test]
    fn node_limit_caps_the_arena() {
        let index = PatternIndex::build(
            sample_index().patterns().cloned(),
            IndexConfig {
                max_nodes: 2,
                ..IndexConfig::default()
            },
        )
        .unwrap();
        let tree = InfluenceTree::build(&index, "y", CardinalityBounds::UNBOUNDED).unwrap();
        assert_eq!(tree.nodes.len(), 2);
    }

    #[test]
    fn missing_root_is_an_error() {
        let index = sample_index();
        assert!(matches!(
            InfluenceTree::build(&index, "zzz", CardinalityBounds::UNBOUNDED),
            Err(IndexError::RootNotFound(_))
        ));
    }
}

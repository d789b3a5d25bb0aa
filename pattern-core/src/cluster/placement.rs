//! Deterministic project → server ownership.
//!
//! Every node evaluates the same pure function over the same sorted peer list,
//! so routing agrees without any extra coordination.

use crate::types::ProjectId;

/// Position of `local` in `sorted(peers)`, or `None` when it is absent.
#[must_use]
pub fn ordinal(local: &str, peers: &[String]) -> Option<usize> {
    let mut sorted: Vec<&str> = peers.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.binary_search(&local).ok()
}

/// Index into the sorted peer list of the server owning `project`.
#[must_use]
pub fn owner_index(project: ProjectId, peer_count: usize) -> Option<usize> {
    if peer_count == 0 {
        return None;
    }
    Some(jump_consistent_hash(stable_project_hash(project), peer_count))
}

/// FNV-1a over the decimal form of the project id.
#[must_use]
pub fn stable_project_hash(project: ProjectId) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x1000_0000_01b3;
    project.to_string().bytes().fold(FNV_OFFSET, |hash, byte| {
        let hash = hash ^ u64::from(byte);
        hash.wrapping_mul(FNV_PRIME)
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn jump_consistent_hash(mut key: u64, buckets: usize) -> usize {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    let buckets = i64::try_from(buckets).unwrap_or(i64::MAX);
    while j < buckets {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        let denom = ((key >> 33) + 1) as f64;
        j = (((b as f64) + 1.0) * (1u64 << 31) as f64 / denom) as i64;
    }
    b.max(0) as usize
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use proptest::prelude::*;

    fn peers(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(|addr| (*addr).to_string()).collect()
    }

    #[test]
    fn ordinal_uses_sorted_position() {
        let list = peers(&["10.0.0.3:8100", "10.0.0.1:8100", "10.0.0.2:8100"]);
        assert_eq!(ordinal("10.0.0.1:8100", &list), Some(0));
        assert_eq!(ordinal("10.0.0.3:8100", &list), Some(2));
        assert_eq!(ordinal("10.0.0.9:8100", &list), None);
        assert_eq!(ordinal("10.0.0.1:8100", &[]), None);
    }

    #[test]
    fn owner_is_stable_for_known_inputs() {
        assert_eq!(owner_index(1, 1), Some(0));
        assert_eq!(owner_index(1, 0), None);
        let first = owner_index(42, 5);
        assert_eq!(first, owner_index(42, 5));
    }

    #[test]
    fn growing_cluster_moves_few_projects() {
        let moved = (0..1000)
            .filter(|project| owner_index(*project, 4) != owner_index(*project, 5))
            .count();
        // Jump hashing relocates roughly 1/5 of the keys.
        assert!(moved < 350, "moved {moved} of 1000 projects");
    }

    proptest! {
        #[test]
        fn ordinal_ignores_input_order(mut addrs in proptest::collection::btree_set("[a-z]{1,6}:[0-9]{2,4}", 1..12), pick in 0usize..12) {
            let list: Vec<String> = addrs.iter().cloned().collect();
            let local = list[pick % list.len()].clone();
            let mut shuffled = list.clone();
            shuffled.reverse();

            let expected = ordinal(&local, &list);
            prop_assert_eq!(expected, ordinal(&local, &shuffled));
            prop_assert_eq!(expected, ordinal(&local, &list));
            prop_assert!(expected.is_some());

            addrs.remove(&local);
            let without: Vec<String> = addrs.into_iter().collect();
            prop_assert_eq!(ordinal(&local, &without), None);
        }

        #[test]
        fn owner_index_is_in_range(project in any::<i64>(), peers in 1usize..64) {
            let owner = owner_index(project, peers).unwrap();
            prop_assert!(owner < peers);
        }
    }
}

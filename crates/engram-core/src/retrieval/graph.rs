//! Graph proximity signal.
//!
//! Memory-to-memory relations (SIMILAR_TO, LED_TO, ...) live in a join table.
//! Proximity to an anchor memory is 1.0 for direct neighbors, 0.5 at two
//! hops, 0 beyond. Traversal depth is bounded at 2 and cycles are prevented
//! with a visited set. When no edges exist the signal is uniformly 0.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::stores::{RelationalStore, StoreResult};

/// Maximum traversal depth
const MAX_HOPS: u32 = 2;

/// Proximity at each hop distance
fn proximity_for_hops(hops: u32) -> f64 {
    match hops {
        1 => 1.0,
        2 => 0.5,
        _ => 0.0,
    }
}

/// Breadth-first proximity map from an anchor memory.
///
/// Returns every memory reachable within two hops mapped to its proximity.
/// The anchor itself is not included.
pub fn proximity_map(
    relational: &Arc<RelationalStore>,
    anchor: &str,
) -> StoreResult<HashMap<String, f64>> {
    let mut proximity = HashMap::new();
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(anchor.to_string());

    let mut frontier = VecDeque::new();
    frontier.push_back((anchor.to_string(), 0u32));

    while let Some((id, hops)) = frontier.pop_front() {
        if hops >= MAX_HOPS {
            continue;
        }
        for edge in relational.neighbors(&id)? {
            let other = if edge.src_id == id {
                edge.dst_id
            } else {
                edge.src_id
            };
            if !visited.insert(other.clone()) {
                continue;
            }
            let score = proximity_for_hops(hops + 1);
            if score > 0.0 {
                proximity.insert(other.clone(), score);
            }
            frontier.push_back((other, hops + 1));
        }
    }
    Ok(proximity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, Arc<RelationalStore>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RelationalStore::open(&dir.path().join("relational.db")).unwrap());
        (dir, store)
    }

    #[test]
    fn test_direct_and_two_hop_scores() {
        let (_dir, relational) = store();
        relational.add_relation("a", "b", "SIMILAR_TO", 1.0).unwrap();
        relational.add_relation("b", "c", "LED_TO", 0.8).unwrap();
        relational.add_relation("c", "d", "LED_TO", 0.8).unwrap();

        let proximity = proximity_map(&relational, "a").unwrap();
        assert_eq!(proximity.get("b"), Some(&1.0));
        assert_eq!(proximity.get("c"), Some(&0.5));
        // Three hops out is beyond the bound
        assert_eq!(proximity.get("d"), None);
    }

    #[test]
    fn test_cycles_do_not_loop() {
        let (_dir, relational) = store();
        relational.add_relation("a", "b", "SIMILAR_TO", 1.0).unwrap();
        relational.add_relation("b", "a", "SIMILAR_TO", 1.0).unwrap();
        relational.add_relation("b", "c", "SIMILAR_TO", 1.0).unwrap();

        let proximity = proximity_map(&relational, "a").unwrap();
        assert_eq!(proximity.len(), 2);
        assert_eq!(proximity.get("b"), Some(&1.0));
        assert_eq!(proximity.get("c"), Some(&0.5));
        assert!(!proximity.contains_key("a"));
    }

    #[test]
    fn test_no_edges_means_empty_map() {
        let (_dir, relational) = store();
        let proximity = proximity_map(&relational, "lonely").unwrap();
        assert!(proximity.is_empty());
    }

    #[test]
    fn test_edges_are_bidirectional_for_traversal() {
        let (_dir, relational) = store();
        relational.add_relation("x", "a", "LED_TO", 1.0).unwrap();

        // Anchor on the destination side still reaches the source
        let proximity = proximity_map(&relational, "a").unwrap();
        assert_eq!(proximity.get("x"), Some(&1.0));
    }
}

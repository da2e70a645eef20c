//! Dependency ordering for message batches.
//!
//! History queries return frames in whatever order the transport stores them.
//! Sorting a batch so that a referenced message precedes its dependents lets
//! most of the batch fold straight into the reducer instead of passing through
//! the pending buffer.

use crate::dag::ContentHash;
use std::collections::{HashMap, HashSet, VecDeque};

/// Trait for messages that reference other messages by id.
pub trait DagNodeOps {
    /// Returns the id of this message.
    fn hash(&self) -> &ContentHash;

    /// Returns the ids this message depends on.
    fn parent_hashes(&self) -> Vec<ContentHash>;

    /// Returns the author-claimed timestamp in milliseconds.
    fn created_at(&self) -> u64;
}

/// Sorts `nodes` so that parents present in the batch come before children.
///
/// Uses Kahn's algorithm with `(created_at, hash)` as the tiebreaker, so the
/// output is deterministic for a given input set. References to ids outside
/// the batch are ignored. Duplicate ids keep their first occurrence.
pub fn dependency_order<N: DagNodeOps>(nodes: Vec<N>) -> Vec<N> {
    let mut seen = HashSet::new();
    let mut nodes: Vec<N> = nodes
        .into_iter()
        .filter(|n| seen.insert(*n.hash()))
        .collect();
    nodes.sort_by(|a, b| {
        (a.created_at(), a.hash()).cmp(&(b.created_at(), b.hash()))
    });

    let index: HashMap<ContentHash, usize> =
        nodes.iter().enumerate().map(|(i, n)| (*n.hash(), i)).collect();

    let mut pending_parents = vec![0usize; nodes.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for parent in node.parent_hashes() {
            if let Some(&p) = index.get(&parent) {
                if p != i {
                    pending_parents[i] += 1;
                    children[p].push(i);
                }
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..nodes.len())
        .filter(|&i| pending_parents[i] == 0)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &child in &children[i] {
            pending_parents[child] -= 1;
            if pending_parents[child] == 0 {
                ready.push_back(child);
            }
        }
    }

    // Cycles cannot occur between content-addressed ids, but a malformed
    // batch must not lose messages.
    if order.len() < nodes.len() {
        let placed: HashSet<usize> = order.iter().copied().collect();
        order.extend((0..nodes.len()).filter(|i| !placed.contains(i)));
    }

    let mut slots: Vec<Option<N>> = nodes.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug)]
    struct TestNode {
        hash: ContentHash,
        parent: Option<ContentHash>,
        created_at: u64,
    }

    impl DagNodeOps for TestNode {
        fn hash(&self) -> &ContentHash {
            &self.hash
        }

        fn parent_hashes(&self) -> Vec<ContentHash> {
            self.parent.into_iter().collect()
        }

        fn created_at(&self) -> u64 {
            self.created_at
        }
    }

    fn node(id: u8, parent: Option<u8>, created_at: u64) -> TestNode {
        TestNode {
            hash: ContentHash::from_bytes([id; 32]),
            parent: parent.map(|p| ContentHash::from_bytes([p; 32])),
            created_at,
        }
    }

    #[test]
    fn test_parent_before_child_despite_timestamps() {
        // Child claims an earlier timestamp than its parent (clock skew).
        let nodes = vec![node(2, Some(1), 10), node(1, None, 20), node(3, Some(2), 5)];
        let ordered: Vec<u8> = dependency_order(nodes)
            .iter()
            .map(|n| n.hash.as_bytes()[0])
            .collect();
        assert_eq!(ordered, vec![1, 2, 3]);
    }

    #[test]
    fn test_independent_nodes_sorted_by_time() {
        let nodes = vec![node(9, None, 30), node(8, None, 10), node(7, None, 20)];
        let ordered: Vec<u8> = dependency_order(nodes)
            .iter()
            .map(|n| n.hash.as_bytes()[0])
            .collect();
        assert_eq!(ordered, vec![8, 7, 9]);
    }

    #[test]
    fn test_external_parents_ignored_and_duplicates_dropped() {
        let nodes = vec![node(2, Some(99), 10), node(2, Some(99), 10), node(1, None, 5)];
        let ordered = dependency_order(nodes);
        assert_eq!(ordered.len(), 2);
    }
}

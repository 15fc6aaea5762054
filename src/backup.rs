//! Backs up a leaf's evaluation up the path that reached it.
//!
//! Value alternates sign at every step (each ply is the opponent's
//! perspective of the one below it); moves-left increases by one per
//! step away from the leaf. Virtual loss is removed only after the
//! real stats are visible, so a concurrent selector never observes a
//! node with neither the virtual-loss pessimism nor the real value.

use crate::node_store::{NodeIdx, NodeStore};
use crate::selector::LeafPath;

/// One backed-up evaluation: a WDL-derived scalar value and a
/// moves-left estimate, both expressed from the leaf's own perspective.
#[derive(Debug, Clone, Copy)]
pub struct BackupValue {
    pub value: f64,
    pub moves_left: f64,
}

impl BackupValue {
    pub fn terminal(value: f32) -> Self {
        BackupValue { value: value as f64, moves_left: 0.0 }
    }
}

/// Applies `result` to every node on `path`, from the leaf back to the
/// root, alternating sign, then removes the virtual loss the selector
/// applied on the way down.
pub fn backup(store: &NodeStore, path: &LeafPath, result: BackupValue, virtual_loss_per_visit: i32) {
    let mut value = result.value;
    let mut moves_left = result.moves_left;

    for &idx in path.nodes.iter().rev() {
        store.node(idx).apply_backup(value, moves_left);
        value = -value;
        moves_left += 1.0;
    }

    for &idx in &path.nodes {
        store.node(idx).remove_virtual_loss(virtual_loss_per_visit);
    }
}

/// Reconstructs the principal variation below `root`: the sequence of
/// moves reached by always descending into the most-visited child.
pub fn principal_variation(store: &NodeStore, root: NodeIdx, max_len: usize) -> Vec<NodeIdx> {
    let mut pv = vec![root];
    let mut current = root;
    while pv.len() < max_len {
        let node = store.node(current);
        let Some((row, num_children)) = node.child_row() else { break };
        let mut best: Option<(u32, NodeIdx)> = None;
        for i in 0..num_children {
            if let Some(child_idx) = store.child_entry(row, i).child() {
                let n = store.node(child_idx).visits();
                if best.map_or(true, |(best_n, _)| n > best_n) {
                    best = Some((n, child_idx));
                }
            }
        }
        match best {
            Some((n, child_idx)) if n > 0 => {
                pv.push(child_idx);
                current = child_idx;
            }
            _ => break,
        }
    }
    pv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_store::NodeStore;

    #[test]
    fn backup_alternates_sign_and_clears_virtual_loss() {
        let store = NodeStore::new(8, 4);
        let root = store.alloc_root((1, 0)).unwrap();
        store.try_claim_expansion(root);
        store.expand(root, &[(crate::position::EncodedMove(1), 1.0)]).unwrap();
        let child = store.alloc_node(root, Some(crate::position::EncodedMove(1)), (2, 0)).unwrap();
        store.link_child(0, 0, child);

        store.node(root).add_virtual_loss(1);
        store.node(child).add_virtual_loss(1);

        let path = LeafPath { nodes: vec![root, child], pending_child: None };
        backup(&store, &path, BackupValue { value: 0.6, moves_left: 10.0 }, 1);

        assert_eq!(store.node(child).visits(), 1);
        assert!((store.node(child).mean_value() - 0.6).abs() < 1e-9);
        assert_eq!(store.node(root).visits(), 1);
        assert!((store.node(root).mean_value() - (-0.6)).abs() < 1e-9);
        assert_eq!(store.node(root).virtual_loss(), 0);
        assert_eq!(store.node(child).virtual_loss(), 0);
    }

    #[test]
    fn virtual_loss_per_visit_zero_matches_a_run_with_no_virtual_loss_at_all() {
        fn one_node_tree() -> (NodeStore, NodeIdx, NodeIdx) {
            let store = NodeStore::new(8, 4);
            let root = store.alloc_root((1, 0)).unwrap();
            store.try_claim_expansion(root);
            store.expand(root, &[(crate::position::EncodedMove(1), 1.0)]).unwrap();
            let child = store.alloc_node(root, Some(crate::position::EncodedMove(1)), (2, 0)).unwrap();
            store.link_child(0, 0, child);
            (store, root, child)
        }

        // Run A: selection applies virtual loss with the configured
        // (zero) magnitude, as it would in a real cycle.
        let (store_a, root_a, child_a) = one_node_tree();
        store_a.node(root_a).add_virtual_loss(0);
        store_a.node(child_a).add_virtual_loss(0);
        let path_a = LeafPath { nodes: vec![root_a, child_a], pending_child: None };
        backup(&store_a, &path_a, BackupValue { value: 0.3, moves_left: 5.0 }, 0);

        // Run B: virtual loss is never touched at all.
        let (store_b, root_b, child_b) = one_node_tree();
        let path_b = LeafPath { nodes: vec![root_b, child_b], pending_child: None };
        backup(&store_b, &path_b, BackupValue { value: 0.3, moves_left: 5.0 }, 0);

        assert_eq!(store_a.node(child_a).visits(), store_b.node(child_b).visits());
        assert!((store_a.node(child_a).mean_value() - store_b.node(child_b).mean_value()).abs() < 1e-9);
        assert!((store_a.node(root_a).mean_value() - store_b.node(root_b).mean_value()).abs() < 1e-9);
        assert_eq!(store_a.node(root_a).virtual_loss(), store_b.node(root_b).virtual_loss());
        assert_eq!(store_a.node(child_a).virtual_loss(), store_b.node(child_b).virtual_loss());
    }

    #[test]
    fn principal_variation_follows_most_visited_child() {
        let store = NodeStore::new(8, 4);
        let root = store.alloc_root((1, 0)).unwrap();
        store.try_claim_expansion(root);
        store
            .expand(root, &[(crate::position::EncodedMove(1), 0.5), (crate::position::EncodedMove(2), 0.5)])
            .unwrap();
        let a = store.alloc_node(root, Some(crate::position::EncodedMove(1)), (2, 0)).unwrap();
        let b = store.alloc_node(root, Some(crate::position::EncodedMove(2)), (3, 0)).unwrap();
        store.link_child(0, 0, a);
        store.link_child(0, 1, b);

        store.node(a).apply_backup(0.1, 5.0);
        store.node(b).apply_backup(0.1, 5.0);
        store.node(b).apply_backup(0.1, 5.0);

        let pv = principal_variation(&store, root, 3);
        assert_eq!(pv, vec![root, b]);
    }
}

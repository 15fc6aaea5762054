//! Turns a batch of `LeafPath`s into either an immediate backup value
//! (terminal, transposition hit) or a queued `EvalRequest`, and
//! materializes a finished `EvalResult` back into the arena.

use crate::config::SearchConfig;
use crate::error::SearchError;
use crate::evaluator::{EvalBatch, EvalRequest, EvalResult};
use crate::node_store::{NodeIdx, NodeStore};
use crate::position::{EncodedMove, InputDtype, PositionOps};
use crate::selector::LeafPath;

/// How a single leaf resolved during classification.
pub enum LeafOutcome {
    /// The position at this leaf is over; `value` is its terminal WDL
    /// scalar and needs no network evaluation.
    Terminal { value: f32 },
    /// The position's hash already has an established node elsewhere in
    /// the arena with enough visits to trust; `value` is that node's
    /// current mean, copied once rather than re-evaluated.
    Transposition { value: f32 },
    /// Queued into `EvalBatch.requests[batch_index]`. `dedup_of` is
    /// `Some(other_index)` when another leaf already queued the same
    /// position this cycle and both will receive the same result.
    PendingEvaluation { batch_index: usize, dedup_of: Option<usize> },
}

/// A classified leaf paired with the path that reached it and the node
/// actually at the end of that path (its `pending_child`, if any, has
/// already been allocated into a real node by the time this exists).
pub struct ClassifiedLeaf {
    pub path: LeafPath,
    pub leaf: NodeIdx,
    pub outcome: LeafOutcome,
}

/// Classified leaves together with the dense batch to send to a
/// `BatchedEvaluator`, and any leaves that didn't fit this cycle.
pub struct Classification {
    pub batch: EvalBatch,
    pub leaves: Vec<ClassifiedLeaf>,
    pub deferred: Vec<LeafPath>,
}

/// Replays `path` from `root_position`, applying the move stored on
/// each node after the root, to recover the position at the leaf (or at
/// the about-to-be-allocated pending child).
fn replay_position<P: PositionOps>(store: &NodeStore, root_position: &P, path: &LeafPath) -> P {
    let mut pos = root_position.clone();
    for &idx in path.nodes.iter().skip(1) {
        if let Some(mv) = store.node(idx).action_from_parent() {
            pos = pos.apply_move(mv);
        }
    }
    if let Some((row, i)) = path.pending_child {
        let mv = store.child_entry(row, i).encoded_move();
        pos = pos.apply_move(mv);
    }
    pos
}

/// Ensures `path`'s leaf is an allocated node, allocating one for
/// `pending_child` (racing other selectors that landed on the same
/// slot via `ChildEntry::try_claim`) if necessary. Returns the node
/// index and the position there.
fn materialize_leaf_node<P: PositionOps>(
    store: &NodeStore,
    root_position: &P,
    path: &LeafPath,
) -> Result<(NodeIdx, P), SearchError> {
    let position = replay_position(store, root_position, path);
    let Some((row, i)) = path.pending_child else {
        return Ok((path.leaf(), position));
    };

    let parent = path.leaf();
    if store.try_claim_child_slot(row, i) {
        let hash = position.zobrist_hash();
        let idx = store.alloc_node(parent, Some(store.child_entry(row, i).encoded_move()), hash)?;
        store.link_child(row, i, idx);
        Ok((idx, position))
    } else {
        loop {
            if let Some(idx) = store.child_entry(row, i).child() {
                return Ok((idx, position));
            }
            std::hint::spin_loop();
        }
    }
}

/// Classifies and batches up to `cfg.max_batch_size` leaves.
///
/// `min_visits` is `cfg.transposition_min_visits`: a transposition hit
/// only short-circuits evaluation once the existing node has enough
/// visits for its value to be trustworthy; a hash hit on a thin node
/// still goes to the network like any other leaf.
pub fn classify_and_batch<P: PositionOps>(
    store: &NodeStore,
    root_position: &P,
    paths: Vec<LeafPath>,
    cfg: &SearchConfig,
    dtype: InputDtype,
) -> Result<Classification, SearchError> {
    let max_batch = cfg.max_batch_size;
    let mut requests = Vec::new();
    let mut leaves = Vec::new();
    let mut deferred = Vec::new();
    let mut seen_hashes: Vec<((u64, u32), usize)> = Vec::new();

    for path in paths {
        let (leaf_idx, position) = materialize_leaf_node(store, root_position, &path)?;
        let node = store.node(leaf_idx);

        if node.terminal_status().is_terminal() {
            leaves.push(ClassifiedLeaf {
                path,
                leaf: leaf_idx,
                outcome: LeafOutcome::Terminal { value: node.terminal_status().terminal_value() },
            });
            continue;
        }

        let status = position.terminal_status();
        if status.is_terminal() {
            node.set_terminal(status);
            leaves.push(ClassifiedLeaf {
                path,
                leaf: leaf_idx,
                outcome: LeafOutcome::Terminal { value: status.terminal_value() },
            });
            continue;
        }

        let hash = position.zobrist_hash();
        let authoritative = store.transposition_insert_or_get(hash, leaf_idx);
        if authoritative != leaf_idx {
            let source = store.node(authoritative);
            if source.visits() >= cfg.transposition_min_visits {
                leaves.push(ClassifiedLeaf {
                    path,
                    leaf: leaf_idx,
                    outcome: LeafOutcome::Transposition { value: source.mean_value() as f32 },
                });
                continue;
            }
        }

        if requests.len() >= max_batch {
            deferred.push(path);
            continue;
        }

        let dedup_of = seen_hashes.iter().find(|(h, _)| *h == hash).map(|(_, idx)| *idx);
        let batch_index = match dedup_of {
            Some(idx) => idx,
            None => {
                let legal_moves = position.legal_moves();
                let planes = position.encode(dtype);
                requests.push(EvalRequest { planes, legal_moves });
                let idx = requests.len() - 1;
                seen_hashes.push((hash, idx));
                idx
            }
        };
        leaves.push(ClassifiedLeaf {
            path,
            leaf: leaf_idx,
            outcome: LeafOutcome::PendingEvaluation { batch_index, dedup_of },
        });
    }

    let real_len = requests.len();
    Ok(Classification { batch: EvalBatch { requests, real_len }, leaves, deferred })
}

/// Applies a network result to a just-evaluated node: expands its child
/// row with the returned policy restricted to its legal moves, and
/// records value/moves-left/policy uncertainty for reporting.
pub fn materialize_evaluation(
    store: &NodeStore,
    leaf: NodeIdx,
    legal_moves: &[EncodedMove],
    result: &EvalResult,
) -> Result<(), SearchError> {
    let node = store.node(leaf);
    node.set_value_uncertainty(result.value_uncertainty);
    node.set_policy_uncertainty(result.policy_uncertainty);
    if let Some(secondary) = result.secondary_value {
        node.set_secondary_value(secondary);
    }

    if store.try_claim_expansion(leaf) {
        let moves_and_priors: Vec<(EncodedMove, f32)> =
            legal_moves.iter().copied().zip(result.policy.iter().copied()).collect();
        store.expand(leaf, &moves_and_priors)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{PositionPlanes, TerminalStatus};

    #[derive(Clone)]
    struct CounterPosition {
        n: u64,
    }

    impl PositionOps for CounterPosition {
        fn apply_move(&self, mv: EncodedMove) -> Self {
            CounterPosition { n: self.n.wrapping_mul(31).wrapping_add(mv.0 as u64) }
        }

        fn legal_moves(&self) -> Vec<EncodedMove> {
            if self.n % 7 == 0 {
                vec![]
            } else {
                vec![EncodedMove(1), EncodedMove(2)]
            }
        }

        fn terminal_status(&self) -> TerminalStatus {
            if self.n % 7 == 0 {
                TerminalStatus::DrawStalemate
            } else {
                TerminalStatus::NotTerminal
            }
        }

        fn zobrist_hash(&self) -> (u64, u32) {
            (self.n, 0)
        }

        fn encode(&self, _dtype: InputDtype) -> PositionPlanes {
            PositionPlanes::F32(vec![self.n as f32])
        }
    }

    #[test]
    fn unexpanded_root_classifies_as_pending_evaluation() {
        let store = NodeStore::new(8, 4);
        let root = store.alloc_root((1, 0)).unwrap();
        let path = LeafPath { nodes: vec![root], pending_child: None };
        let cfg = SearchConfig::default();
        let root_pos = CounterPosition { n: 1 };

        let classification =
            classify_and_batch(&store, &root_pos, vec![path], &cfg, InputDtype::F32).unwrap();
        assert_eq!(classification.batch.real_len, 1);
        assert_eq!(classification.leaves.len(), 1);
        assert!(matches!(
            classification.leaves[0].outcome,
            LeafOutcome::PendingEvaluation { batch_index: 0, dedup_of: None }
        ));
    }

    #[test]
    fn stalemate_position_classifies_as_terminal() {
        let store = NodeStore::new(8, 4);
        let root = store.alloc_root((7, 0)).unwrap();
        let path = LeafPath { nodes: vec![root], pending_child: None };
        let cfg = SearchConfig::default();
        let root_pos = CounterPosition { n: 7 };

        let classification =
            classify_and_batch(&store, &root_pos, vec![path], &cfg, InputDtype::F32).unwrap();
        assert!(matches!(classification.leaves[0].outcome, LeafOutcome::Terminal { value: 0.0 }));
        assert_eq!(classification.batch.real_len, 0);
    }

    #[test]
    fn duplicate_positions_dedup_into_one_request() {
        let store = NodeStore::new(16, 4);
        let root = store.alloc_root((1, 0)).unwrap();
        store.try_claim_expansion(root);
        // Two transposing moves that reach the same resulting position.
        store.expand(root, &[(EncodedMove(5), 0.5), (EncodedMove(5), 0.5)]).unwrap();

        let path_a = LeafPath { nodes: vec![root], pending_child: Some((0, 0)) };
        let path_b = LeafPath { nodes: vec![root], pending_child: Some((0, 1)) };
        let cfg = SearchConfig::default();
        let root_pos = CounterPosition { n: 0 };

        let classification = classify_and_batch(&store, &root_pos, vec![path_a, path_b], &cfg, InputDtype::F32)
            .unwrap();

        assert_eq!(classification.batch.real_len, 1);
        assert_eq!(classification.leaves.len(), 2);
    }
}

//! PUCT descent: walks from the root to a leaf, applying virtual loss
//! along the way.
//!
//! Every level picks the child maximizing `Q + c * P * sqrt(N_parent) /
//! (1 + N_child)`, with unvisited children scored via a first-play
//! urgency fallback derived from the parent's own value.

use rand::SeedableRng;
use rand_distr::{Dirichlet, Distribution};

use crate::config::SearchConfig;
use crate::node_store::{NodeIdx, NodeStore, RowIdx, NONE};

/// A walk from the root down to either an already-allocated node (a
/// terminal, or a node still awaiting evaluation) or an unexpanded
/// child slot that has no node yet.
#[derive(Debug, Clone)]
pub struct LeafPath {
    /// Root-to-leaf node indices, inclusive of both ends.
    pub nodes: Vec<NodeIdx>,
    /// If the walk ended at a child row slot with no node allocated
    /// yet, its `(row, index)`. `None` if `nodes.last()` is itself the
    /// leaf (terminal, or awaiting its first evaluation).
    pub pending_child: Option<(RowIdx, u32)>,
}

impl LeafPath {
    /// The effective leaf: the last allocated node on the path. The
    /// Leaf Collector allocates `pending_child` into a real node before
    /// treating it as this.
    pub fn leaf(&self) -> NodeIdx {
        *self.nodes.last().expect("a LeafPath always has at least the root")
    }
}

fn cpuct(n_parent: f64, cfg: &SearchConfig, at_root: bool) -> f64 {
    let base = cfg.cpuct_base as f64
        + cfg.cpuct_factor as f64 * ((n_parent + cfg.cpuct_init as f64) / cfg.cpuct_init as f64).ln();
    if at_root {
        base * cfg.cpuct_at_root_multiplier as f64
    } else {
        base
    }
}

/// Effective (Q, N) for a child, folding in virtual loss: effective N is
/// `N + vloss`, effective value adds a pessimistic `-1` per virtual loss.
fn effective_child_stats(store: &NodeStore, child_idx: NodeIdx) -> (f64, u32) {
    let node = store.node(child_idx);
    let n = node.visits();
    let vloss = node.virtual_loss().max(0) as u32;
    let eff_n = n + vloss;
    if eff_n == 0 {
        (0.0, 0)
    } else {
        let raw_sum = node.mean_value() * n as f64;
        let eff_sum = raw_sum - vloss as f64;
        (eff_sum / eff_n as f64, eff_n)
    }
}

/// Scores one child row slot for PUCT selection.
fn score_slot(
    store: &NodeStore,
    row: RowIdx,
    i: u32,
    parent_fpu: f64,
    sqrt_n_parent: f64,
    c: f64,
    effective_priors: &[f32],
) -> f64 {
    let entry = store.child_entry(row, i);
    let prior = effective_priors[i as usize] as f64;

    let (q, n_child) = match entry.child() {
        Some(child_idx) => {
            let (q, n) = effective_child_stats(store, child_idx);
            if n == 0 {
                (parent_fpu, 0)
            } else {
                (-q, n)
            }
        }
        None => (parent_fpu, 0),
    };

    q + c * prior * sqrt_n_parent / (1.0 + n_child as f64)
}

/// Priors to use for selection at `parent_idx`: the stored priors,
/// optionally blended with Dirichlet noise when selecting from the
/// root and `dirichlet_noise_epsilon > 0`.
fn selection_priors(
    store: &NodeStore,
    row: RowIdx,
    num_children: u32,
    at_root: bool,
    cfg: &SearchConfig,
    rng: &mut impl rand::Rng,
) -> Vec<f32> {
    let raw: Vec<f32> = (0..num_children).map(|i| store.child_entry(row, i).prior()).collect();
    if !at_root || cfg.dirichlet_noise_epsilon <= 0.0 || num_children == 0 {
        return raw;
    }
    let alpha = vec![cfg.dirichlet_noise_alpha as f64; num_children as usize];
    let noise = match Dirichlet::new(&alpha) {
        Ok(dist) => dist.sample(rng),
        Err(_) => vec![1.0 / num_children as f64; num_children as usize],
    };
    let eps = cfg.dirichlet_noise_epsilon as f64;
    raw.iter()
        .zip(noise)
        .map(|(&p, n)| ((1.0 - eps) * p as f64 + eps * n) as f32)
        .collect()
}

/// Descends from `root`, choosing the highest-PUCT child at each level,
/// applying virtual loss to every allocated node it passes through.
/// Stops at a terminal node, an unevaluated leaf, or an unexpanded
/// child slot.
fn select_one_path(store: &NodeStore, root: NodeIdx, cfg: &SearchConfig, rng: &mut impl rand::Rng) -> LeafPath {
    let mut nodes = vec![root];
    store.node(root).add_virtual_loss(cfg.virtual_loss_per_visit as i32);

    let mut current = root;
    loop {
        let node = store.node(current);
        if node.terminal_status().is_terminal() {
            break;
        }
        let (row, num_children) = match node.child_row() {
            Some(rc) => rc,
            None => break, // not yet expanded: this is the leaf.
        };
        if num_children == 0 {
            break;
        }

        let at_root = current == root;
        let n_parent = node.visits();
        let fpu_reduction = if at_root { cfg.fpu_reduction_at_root } else { cfg.fpu_reduction } as f64;
        let parent_q = -node.mean_value(); // from the child's perspective
        let priors = selection_priors(store, row, num_children, at_root, cfg, rng);
        let sum_visited_priors: f64 = (0..num_children)
            .filter(|&i| {
                store
                    .child_entry(row, i)
                    .child()
                    .map(|c| store.node(c).visits() > 0)
                    .unwrap_or(false)
            })
            .map(|i| priors[i as usize] as f64)
            .sum();
        let parent_fpu = parent_q - fpu_reduction * sum_visited_priors.sqrt();
        let c = cpuct(n_parent as f64, cfg, at_root);
        let sqrt_n_parent = (n_parent.max(1) as f64).sqrt();

        let mut best_i = 0u32;
        let mut best_score = f64::NEG_INFINITY;
        for i in 0..num_children {
            let score = score_slot(store, row, i, parent_fpu, sqrt_n_parent, c, &priors);
            if score > best_score {
                best_score = score;
                best_i = i;
            }
            // Ties favor the lower index: since we iterate in ascending
            // index order and only replace on strict improvement, the
            // first (lowest-index) maximizer is kept automatically.
        }

        match store.child_entry(row, best_i).child() {
            Some(child_idx) => {
                store.node(child_idx).add_virtual_loss(cfg.virtual_loss_per_visit as i32);
                nodes.push(child_idx);
                current = child_idx;
            }
            None => {
                return LeafPath { nodes, pending_child: Some((row, best_i)) };
            }
        }
    }

    LeafPath { nodes, pending_child: None }
}

/// The selector component of the engine. Holds only an RNG for root
/// noise and tie-breaking among otherwise-equal leaves; all tree state
/// lives in the shared `NodeStore`.
pub struct Selector {
    rng: rand::rngs::SmallRng,
}

impl Selector {
    pub fn new(seed: u64) -> Self {
        Selector { rng: rand::rngs::SmallRng::seed_from_u64(seed) }
    }

    /// Collects up to `k` leaf paths from `root`. May return fewer than
    /// `k` if the tree has no more than that many live frontier slots
    /// worth visiting (in practice this rarely binds; callers should
    /// not assume exactly `k`).
    pub fn collect_leaves(&mut self, store: &NodeStore, root: NodeIdx, k: usize, cfg: &SearchConfig) -> Vec<LeafPath> {
        debug_assert_ne!(root, NONE);
        (0..k).map(|_| select_one_path(store, root, cfg, &mut self.rng)).collect()
    }

    /// Reverses the virtual loss this selector applied to an abandoned
    /// partial path, e.g. on cancellation mid-cycle.
    pub fn unwind(&self, store: &NodeStore, path: &LeafPath, amount: i32) {
        for &idx in &path.nodes {
            store.node(idx).remove_virtual_loss(amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::EncodedMove;

    fn cfg() -> SearchConfig {
        SearchConfig::default()
    }

    #[test]
    fn unexpanded_root_is_its_own_leaf() {
        let store = NodeStore::new(8, 4);
        let root = store.alloc_root((1, 0)).unwrap();
        let mut sel = Selector::new(1);
        let paths = sel.collect_leaves(&store, root, 3, &cfg());
        assert_eq!(paths.len(), 3);
        for p in &paths {
            assert_eq!(p.nodes, vec![root]);
            assert_eq!(p.pending_child, None);
        }
        // virtual loss applied once per walk
        assert_eq!(store.node(root).virtual_loss(), 3);
    }

    #[test]
    fn expanded_root_selects_a_pending_child() {
        let store = NodeStore::new(8, 4);
        let root = store.alloc_root((1, 0)).unwrap();
        store.try_claim_expansion(root);
        store
            .expand(root, &[(EncodedMove(1), 0.5), (EncodedMove(2), 0.5)])
            .unwrap();

        let mut sel = Selector::new(1);
        let paths = sel.collect_leaves(&store, root, 1, &cfg());
        assert_eq!(paths[0].nodes, vec![root]);
        assert!(paths[0].pending_child.is_some());
    }

    #[test]
    fn terminal_root_is_leaf_with_no_pending_child() {
        let store = NodeStore::new(8, 4);
        let root = store.alloc_root((1, 0)).unwrap();
        store.node(root).set_terminal(crate::position::TerminalStatus::DrawInsufficient);

        let mut sel = Selector::new(1);
        let paths = sel.collect_leaves(&store, root, 2, &cfg());
        for p in &paths {
            assert_eq!(p.nodes, vec![root]);
            assert_eq!(p.pending_child, None);
        }
    }
}

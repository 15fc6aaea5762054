//! Search configuration.
//!
//! Every tunable that shapes search behavior lives in one runtime struct
//! rather than as compile-time constants, since each one is meant to be
//! a host-supplied engine option.

use serde::Deserialize;

/// Policy used to choose the final move once a search stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BestMoveSelection {
    /// Pick the root child with the highest visit count.
    MaxN,
    /// Pick the root child with the highest Q.
    MaxQ,
    /// Pick the highest-visit child, breaking ties by Q.
    MaxNWithQTiebreak,
}

impl Default for BestMoveSelection {
    fn default() -> Self {
        BestMoveSelection::MaxNWithQTiebreak
    }
}

/// A search termination limit. `SearchDriver::search` stops the first
/// time any configured condition is met.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SearchLimit {
    /// Wall-clock budget for the whole search.
    pub time_budget_ms: Option<u64>,
    /// Stop once this many nodes have been allocated.
    pub node_budget: Option<u32>,
    /// Stop once the best root child's Q lead over the second-best
    /// child's Q exceeds this threshold (adaptive early stop).
    pub q_diff_threshold: Option<f32>,
    /// Stop after this many selector/backup cycles, regardless of size.
    pub cycle_budget: Option<u32>,
}

/// All tunables governing selection, expansion and backup for one search.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub cpuct_base: f32,
    pub cpuct_factor: f32,
    pub cpuct_init: f32,
    pub cpuct_at_root_multiplier: f32,
    pub fpu_reduction: f32,
    pub fpu_reduction_at_root: f32,
    pub policy_softmax_temperature: f32,
    pub dirichlet_noise_epsilon: f32,
    pub dirichlet_noise_alpha: f32,
    pub virtual_loss_per_visit: u32,
    pub transposition_min_visits: u32,
    pub max_nodes: u32,
    pub max_batch_size: usize,
    pub target_batch_size: usize,
    pub num_worker_threads: usize,
    pub tree_reuse_enabled: bool,
    pub best_move_selection: BestMoveSelection,
    /// Pins every worker's selection RNG (root Dirichlet noise and
    /// leaf-path tie-breaking) to a fixed base seed instead of a
    /// process-random one. Required for bit-reproducible searches
    /// (same `max_nodes`, same evaluator, same seed, `num_worker_threads
    /// = 1` → identical best move and visit distribution); left `None`
    /// for normal play, where each search should explore differently.
    pub seed: Option<u64>,
}

impl Default for SearchConfig {
    /// Defaults chosen to match commonly published Leela-family PUCT
    /// settings; callers are expected to override from engine options.
    fn default() -> Self {
        SearchConfig {
            cpuct_base: 1.25,
            cpuct_factor: 2.0,
            cpuct_init: 19652.0,
            cpuct_at_root_multiplier: 1.0,
            fpu_reduction: 0.25,
            fpu_reduction_at_root: 0.1,
            policy_softmax_temperature: 1.0,
            dirichlet_noise_epsilon: 0.0,
            dirichlet_noise_alpha: 0.3,
            virtual_loss_per_visit: 1,
            transposition_min_visits: 4,
            max_nodes: 2_000_000,
            max_batch_size: 512,
            target_batch_size: 64,
            num_worker_threads: 2,
            tree_reuse_enabled: true,
            best_move_selection: BestMoveSelection::MaxNWithQTiebreak,
            seed: None,
        }
    }
}

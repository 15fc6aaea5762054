//! The top-level search entry point: owns the arena and worker pool for
//! one search, applies `SearchLimit`s, and reduces the finished tree to
//! a best move and a PV report.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use crate::backup::principal_variation;
use crate::config::{BestMoveSelection, SearchConfig, SearchLimit};
use crate::error::{SearchError, SearchOutcome};
use crate::evaluator::BatchedEvaluator;
use crate::evaluator_gateway::{EvaluatorGateway, GatewayStats};
use crate::node_store::{NodeIdx, NodeStore};
use crate::position::{EncodedMove, PositionOps};
use crate::worker::WorkerPool;

/// One root child's final stats, as reported to the caller.
#[derive(Debug, Clone)]
pub struct RootChildReport {
    pub mv: EncodedMove,
    pub visits: u32,
    pub q: f64,
    pub prior: f32,
}

/// Why a search stopped. Not an error: every variant still carries a
/// valid `SearchResult` built from whatever was searched so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStatus {
    /// Stopped because a `SearchLimit` condition (time/node/cycle/Q-diff)
    /// was satisfied — the normal case.
    LimitReached,
    /// Stopped because the node arena ran out of capacity before any
    /// limit was reached.
    CapacityExhausted,
    /// Stopped because a caller called `SearchHandle::stop`.
    Cancelled,
}

/// The outcome of a finished search.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub best_move: EncodedMove,
    pub principal_variation: Vec<EncodedMove>,
    pub root_q: f64,
    pub nodes_searched: u32,
    pub wall_time: Duration,
    pub root_children: Vec<RootChildReport>,
    pub status: SearchStatus,
}

/// A handle a caller can use to cooperatively stop an in-progress
/// search from another thread (e.g. on a "stop" UCI-style command).
#[derive(Clone)]
pub struct SearchHandle {
    stop: Arc<AtomicBool>,
}

impl SearchHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Owns the arena across moves played during one game, so tree reuse
/// can carry subtrees forward between searches when `tree_reuse_enabled`.
pub struct SearchDriver {
    cfg: SearchConfig,
    gateway: Arc<EvaluatorGateway>,
    /// The arena and root node retained from the most recent `search`
    /// call, consulted by the next `search` (if its root position's hash
    /// matches) and rewritten in place by `reparent`.
    retained: Mutex<Option<(Arc<NodeStore>, NodeIdx)>>,
}

impl SearchDriver {
    pub fn new(cfg: SearchConfig, evaluators: Vec<Box<dyn BatchedEvaluator>>) -> Self {
        SearchDriver { cfg, gateway: Arc::new(EvaluatorGateway::new(evaluators)), retained: Mutex::new(None) }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.cfg
    }

    pub fn gateway_stats(&self) -> &GatewayStats {
        self.gateway.stats()
    }

    /// Remaps the arena retained from the last `search` call onto the
    /// child reached by `move_played`, discarding everything else, so the
    /// next `search` on that resulting position resumes from the
    /// subtree already explored rather than rebuilding it from scratch.
    ///
    /// A bump arena can't free earlier slots in place, so this copies the
    /// surviving subtree into a fresh, compact arena of the same
    /// capacity. Returns `true` if a subtree was carried forward; `false`
    /// if there was nothing retained, `move_played` wasn't among the
    /// retained root's expanded children, or that child had no node
    /// allocated yet — in which case the next `search` simply starts
    /// fresh, same as if `tree_reuse_enabled` were `false`.
    pub fn reparent(&self, move_played: EncodedMove) -> bool {
        let mut retained = self.retained.lock();
        let Some((store, root)) = retained.take() else { return false };
        match store.reparent(root, move_played, self.cfg.max_nodes, 32) {
            Some((new_store, new_root)) => {
                *retained = Some((Arc::new(new_store), new_root));
                true
            }
            None => false,
        }
    }

    /// Runs one search from `root_position` until `limit` is met or the
    /// caller stops it via the returned handle, blocking the calling
    /// thread until the search finishes.
    ///
    /// When `cfg.tree_reuse_enabled` and the arena retained from the
    /// previous `search`/`reparent` call is rooted at a node whose hash
    /// matches `root_position`, that arena is reused in place; otherwise
    /// (first call, reuse disabled, or a position that doesn't match what
    /// was retained) a fresh arena is built sized by `cfg.max_nodes`.
    pub fn search<P: PositionOps>(
        &self,
        root_position: P,
        limit: SearchLimit,
    ) -> SearchOutcome<SearchResult> {
        if root_position.legal_moves().is_empty() {
            return Err(SearchError::NoLegalMoves);
        }

        let root_hash = root_position.zobrist_hash();
        let (store, root) = self.take_or_build_arena(root_hash)?;

        let cfg = Arc::new(self.cfg.clone());
        let base_seed = cfg.seed.unwrap_or_else(rng_seed);
        let root_position = Arc::new(root_position);
        let pool = WorkerPool::spawn(
            cfg.num_worker_threads,
            store.clone(),
            root,
            root_position,
            self.gateway.clone(),
            cfg.clone(),
            base_seed,
        );
        let handle = SearchHandle { stop: pool.stop_flag() };

        let start = Instant::now();
        let status = self.wait_for_limit(&store, root, &limit, &handle, start);
        pool.stop_and_join();

        if status == SearchStatus::CapacityExhausted {
            info!(nodes = store.len(), "search stopped: node arena exhausted");
        }

        if self.cfg.tree_reuse_enabled {
            *self.retained.lock() = Some((store.clone(), root));
        }

        self.finish(&store, root, start.elapsed(), status)
    }

    /// Reuses the retained arena if `tree_reuse_enabled` and its root's
    /// hash matches `root_hash`; otherwise allocates a fresh one.
    fn take_or_build_arena(&self, root_hash: (u64, u32)) -> SearchOutcome<(Arc<NodeStore>, NodeIdx)> {
        if self.cfg.tree_reuse_enabled {
            let mut retained = self.retained.lock();
            if let Some((store, root)) = retained.take() {
                if store.node(root).hash() == root_hash {
                    return Ok((store, root));
                }
            }
        }
        let store = Arc::new(NodeStore::new(self.cfg.max_nodes, 32));
        let root = store.alloc_root(root_hash)?;
        Ok((store, root))
    }

    /// Polls `limit` and the handle's stop flag every 5ms on the calling
    /// thread until one of them is satisfied, returning why it stopped.
    ///
    /// The handle's flag is only ever set from outside this loop (by a
    /// caller invoking `SearchHandle::stop`, since `search` itself only
    /// sets it afterwards via `pool.stop_and_join`), so observing it set
    /// here always means external cancellation.
    fn wait_for_limit(
        &self,
        store: &NodeStore,
        root: NodeIdx,
        limit: &SearchLimit,
        handle: &SearchHandle,
        start: Instant,
    ) -> SearchStatus {
        let mut cycles = 0u32;
        loop {
            if handle.is_stopped() {
                return SearchStatus::Cancelled;
            }
            if store.has_overflowed() {
                return SearchStatus::CapacityExhausted;
            }
            if let Some(budget) = limit.time_budget_ms {
                if start.elapsed() >= Duration::from_millis(budget) {
                    return SearchStatus::LimitReached;
                }
            }
            if let Some(budget) = limit.node_budget {
                if store.len() >= budget {
                    return SearchStatus::LimitReached;
                }
            }
            if let Some(threshold) = limit.q_diff_threshold {
                if root_q_lead(store, root) >= threshold as f64 {
                    return SearchStatus::LimitReached;
                }
            }
            cycles += 1;
            if let Some(budget) = limit.cycle_budget {
                if cycles >= budget {
                    return SearchStatus::LimitReached;
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn finish(
        &self,
        store: &NodeStore,
        root: NodeIdx,
        wall_time: Duration,
        status: SearchStatus,
    ) -> SearchOutcome<SearchResult> {
        let Some((row, num_children)) = store.node(root).child_row() else {
            return Err(SearchError::Invariant("root was never expanded"));
        };

        let mut root_children = Vec::with_capacity(num_children as usize);
        for i in 0..num_children {
            let entry = store.child_entry(row, i);
            let (visits, q) = match entry.child() {
                Some(idx) => (store.node(idx).visits(), -store.node(idx).mean_value()),
                None => (0, 0.0),
            };
            root_children.push(RootChildReport { mv: entry.encoded_move(), visits, q, prior: entry.prior() });
        }

        let best = select_best_child(&root_children, self.cfg.best_move_selection)
            .ok_or(SearchError::Invariant("expanded root has no children"))?;

        let pv_nodes = principal_variation(store, root, 64);
        let pv_moves = pv_nodes
            .iter()
            .skip(1)
            .filter_map(|&idx| store.node(idx).action_from_parent())
            .collect();

        Ok(SearchResult {
            best_move: best.mv,
            principal_variation: pv_moves,
            root_q: store.node(root).mean_value(),
            nodes_searched: store.len(),
            wall_time,
            root_children,
            status,
        })
    }
}

fn root_q_lead(store: &NodeStore, root: NodeIdx) -> f64 {
    let Some((row, num_children)) = store.node(root).child_row() else {
        return 0.0;
    };
    let mut qs: Vec<f64> = (0..num_children)
        .filter_map(|i| store.child_entry(row, i).child())
        .filter(|&idx| store.node(idx).visits() > 0)
        .map(|idx| -store.node(idx).mean_value())
        .collect();
    qs.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    match qs.as_slice() {
        [best, second, ..] => best - second,
        _ => 0.0,
    }
}

fn select_best_child(children: &[RootChildReport], policy: BestMoveSelection) -> Option<&RootChildReport> {
    match policy {
        BestMoveSelection::MaxN => children.iter().max_by_key(|c| c.visits),
        BestMoveSelection::MaxQ => {
            children.iter().max_by(|a, b| a.q.partial_cmp(&b.q).unwrap_or(std::cmp::Ordering::Equal))
        }
        BestMoveSelection::MaxNWithQTiebreak => children.iter().max_by(|a, b| {
            a.visits
                .cmp(&b.visits)
                .then_with(|| a.q.partial_cmp(&b.q).unwrap_or(std::cmp::Ordering::Equal))
        }),
    }
}

/// Fallback base seed for worker RNGs when `cfg.seed` is unset: a
/// process-unique, non-deterministic value, since normal play wants each
/// search to explore differently rather than replay the last one. Pin
/// `cfg.seed` instead when bit-reproducibility is required.
fn rng_seed() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish()
}

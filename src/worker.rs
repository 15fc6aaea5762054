//! A fixed pool of OS threads, each running its own
//! select → classify/batch → evaluate → backup cycle against the same
//! shared arena. There is no central dispatcher: every thread competes
//! for work directly on the lock-free `NodeStore`, the way a single
//! `Worker` owns one search loop and many are run side by side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::backup::{backup, BackupValue};
use crate::config::SearchConfig;
use crate::evaluator_gateway::{EvaluatorGateway, GatewayStats};
use crate::leaf_collector::{classify_and_batch, materialize_evaluation, LeafOutcome};
use crate::node_store::{NodeIdx, NodeStore};
use crate::position::PositionOps;
use crate::selector::Selector;

/// Chooses how many leaves to collect this cycle from the gateway's own
/// recent throughput: once enough batches have gone through, track the
/// mean real batch size the gateway has actually been handling rather
/// than always re-requesting `cfg.target_batch_size`, so a worker whose
/// batches are consistently getting padded up or clipped down converges
/// on a size the evaluator is actually seeing. Always clamped to
/// `[target_batch_size, max_batch_size]`, since spec configuration gives
/// those as the floor and ceiling a host wants respected regardless of
/// observed throughput.
fn adaptive_target(cfg: &SearchConfig, stats: &GatewayStats) -> usize {
    let floor = cfg.target_batch_size.max(1);
    let ceiling = cfg.max_batch_size.max(floor);
    let submitted = stats.batches_submitted();
    if submitted < 4 {
        return floor;
    }
    let mean_real_size = stats.positions_evaluated() / submitted;
    (mean_real_size as usize).clamp(floor, ceiling)
}

/// One cycle's worth of work for a single thread: select a batch of
/// leaves, resolve them (directly or via the network), and back up
/// every value. Runs until `stop` is set.
fn run_cycle<P: PositionOps>(
    store: &NodeStore,
    root: NodeIdx,
    root_position: &P,
    gateway: &EvaluatorGateway,
    cfg: &SearchConfig,
    selector: &mut Selector,
) {
    let target = adaptive_target(cfg, gateway.stats());
    let paths = selector.collect_leaves(store, root, target, cfg);

    let classification = match classify_and_batch(store, root_position, paths, cfg, gateway.input_dtype()) {
        Ok(c) => c,
        Err(err) => {
            warn!(error = %err, "leaf classification failed, skipping cycle");
            return;
        }
    };

    for path in &classification.deferred {
        selector.unwind(store, path, cfg.virtual_loss_per_visit as i32);
    }

    let results = if classification.batch.is_empty() {
        Vec::new()
    } else {
        match gateway.evaluate(&classification.batch) {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "evaluator call failed, unwinding pending leaves");
                for leaf in &classification.leaves {
                    if matches!(leaf.outcome, LeafOutcome::PendingEvaluation { .. }) {
                        selector.unwind(store, &leaf.path, cfg.virtual_loss_per_visit as i32);
                    }
                }
                return;
            }
        }
    };

    for leaf in classification.leaves {
        let value = match leaf.outcome {
            LeafOutcome::Terminal { value } => BackupValue::terminal(value),
            LeafOutcome::Transposition { value } => BackupValue::terminal(value),
            LeafOutcome::PendingEvaluation { batch_index, .. } => {
                let request = &classification.batch.requests[batch_index];
                let result = &results[batch_index];
                if let Err(err) =
                    materialize_evaluation(store, leaf.leaf, &request.legal_moves, result)
                {
                    warn!(error = %err, "failed to materialize evaluation, skipping backup");
                    selector.unwind(store, &leaf.path, cfg.virtual_loss_per_visit as i32);
                    continue;
                }
                BackupValue { value: result.q() as f64, moves_left: result.moves_left as f64 }
            }
        };
        backup(store, &leaf.path, value, cfg.virtual_loss_per_visit as i32);
    }
}

/// A single search thread. Owns nothing but its `JoinHandle`; all tree
/// state lives in the `Arc<NodeStore>` shared with its siblings.
pub struct SearchWorker {
    handle: Option<JoinHandle<()>>,
}

impl SearchWorker {
    pub fn spawn<P: PositionOps>(
        id: usize,
        store: Arc<NodeStore>,
        root: NodeIdx,
        root_position: Arc<P>,
        gateway: Arc<EvaluatorGateway>,
        cfg: Arc<SearchConfig>,
        stop: Arc<AtomicBool>,
        seed: u64,
    ) -> Self {
        let handle = thread::Builder::new()
            .name(format!("ceres-worker-{id}"))
            .spawn(move || {
                let mut selector = Selector::new(seed);
                debug!(worker = id, "search worker starting");
                while !stop.load(Ordering::Relaxed) {
                    run_cycle(&store, root, root_position.as_ref(), &gateway, &cfg, &mut selector);
                    if store.has_overflowed() {
                        break;
                    }
                }
                debug!(worker = id, "search worker stopping");
            })
            .expect("failed to spawn search worker thread");
        SearchWorker { handle: Some(handle) }
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A running pool of `SearchWorker`s sharing one stop flag.
pub struct WorkerPool {
    workers: Vec<SearchWorker>,
    stop: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn spawn<P: PositionOps>(
        num_threads: usize,
        store: Arc<NodeStore>,
        root: NodeIdx,
        root_position: Arc<P>,
        gateway: Arc<EvaluatorGateway>,
        cfg: Arc<SearchConfig>,
        base_seed: u64,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let workers = (0..num_threads.max(1))
            .map(|id| {
                SearchWorker::spawn(
                    id,
                    store.clone(),
                    root,
                    root_position.clone(),
                    gateway.clone(),
                    cfg.clone(),
                    stop.clone(),
                    base_seed.wrapping_add(id as u64),
                )
            })
            .collect();
        WorkerPool { workers, stop }
    }

    /// Signals every worker to finish its current cycle and stop, then
    /// waits for all of them to exit.
    pub fn stop_and_join(self) {
        self.stop.store(true, Ordering::Release);
        for worker in self.workers {
            worker.join();
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{BatchedEvaluator, EvalBatch, EvalResult};
    use crate::position::{EncodedMove, InputDtype, PositionPlanes, TerminalStatus};
    use std::time::Duration;

    #[derive(Clone)]
    struct TinyPosition {
        n: u8,
    }

    impl PositionOps for TinyPosition {
        fn apply_move(&self, mv: EncodedMove) -> Self {
            TinyPosition { n: self.n.wrapping_add(mv.0 as u8) }
        }
        fn legal_moves(&self) -> Vec<EncodedMove> {
            vec![EncodedMove(1), EncodedMove(2)]
        }
        fn terminal_status(&self) -> TerminalStatus {
            TerminalStatus::NotTerminal
        }
        fn zobrist_hash(&self) -> (u64, u32) {
            (self.n as u64, 0)
        }
        fn encode(&self, _dtype: InputDtype) -> PositionPlanes {
            PositionPlanes::F32(vec![self.n as f32])
        }
    }

    struct FlatEvaluator;
    impl BatchedEvaluator for FlatEvaluator {
        fn input_dtype(&self) -> InputDtype {
            InputDtype::F32
        }
        fn max_batch_size(&self) -> usize {
            64
        }
        fn min_batch_size(&self) -> usize {
            1
        }
        fn evaluate(&self, batch: &EvalBatch) -> Result<Vec<EvalResult>, crate::error::SearchError> {
            Ok((0..batch.len())
                .map(|_| EvalResult {
                    win_prob: 0.4,
                    loss_prob: 0.3,
                    policy: vec![0.5, 0.5],
                    moves_left: 40.0,
                    value_uncertainty: 0.0,
                    policy_uncertainty: 0.0,
                    secondary_value: None,
                })
                .collect())
        }
    }

    #[test]
    fn adaptive_target_stays_at_floor_before_enough_batches_observed() {
        let cfg = SearchConfig { target_batch_size: 8, max_batch_size: 64, ..SearchConfig::default() };
        let stats = crate::evaluator_gateway::GatewayStats::default();
        assert_eq!(adaptive_target(&cfg, &stats), 8);
    }

    #[test]
    fn pool_runs_and_grows_the_tree() {
        let store = Arc::new(NodeStore::new(2048, 4));
        let root = store.alloc_root((0, 0)).unwrap();
        let gateway = Arc::new(EvaluatorGateway::new(vec![Box::new(FlatEvaluator)]));
        let cfg = Arc::new(SearchConfig { num_worker_threads: 2, target_batch_size: 4, ..SearchConfig::default() });
        let root_position = Arc::new(TinyPosition { n: 0 });

        let pool = WorkerPool::spawn(2, store.clone(), root, root_position, gateway, cfg, 7);
        thread::sleep(Duration::from_millis(50));
        pool.stop_and_join();

        assert!(store.node(root).visits() > 0);
        assert!(store.len() > 1);
    }
}

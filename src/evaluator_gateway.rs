//! Routes assembled batches to one or more `BatchedEvaluator` instances:
//! pads up to each evaluator's minimum batch size, slices padding back
//! off the result, retries once at half size on failure, and tracks
//! rolling throughput/latency stats.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::SearchError;
use crate::evaluator::{BatchedEvaluator, EvalBatch, EvalRequest, EvalResult};
use crate::position::InputDtype;

/// Rolling counters describing gateway throughput, read by the driver
/// for progress reporting.
#[derive(Debug, Default)]
pub struct GatewayStats {
    batches_submitted: AtomicU64,
    positions_evaluated: AtomicU64,
    total_latency_micros: AtomicU64,
    retries: AtomicU64,
}

impl GatewayStats {
    pub fn batches_submitted(&self) -> u64 {
        self.batches_submitted.load(Ordering::Relaxed)
    }

    pub fn positions_evaluated(&self) -> u64 {
        self.positions_evaluated.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Mean wall-clock time per submitted batch.
    pub fn mean_batch_latency(&self) -> Duration {
        let n = self.batches_submitted();
        if n == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.total_latency_micros.load(Ordering::Relaxed) / n)
        }
    }

    fn record(&self, positions: usize, elapsed: Duration) {
        self.batches_submitted.fetch_add(1, Ordering::Relaxed);
        self.positions_evaluated.fetch_add(positions as u64, Ordering::Relaxed);
        self.total_latency_micros.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }
}

struct Slot {
    evaluator: Box<dyn BatchedEvaluator>,
    lock: Mutex<()>,
    in_flight: AtomicU64,
}

/// Owns one or more evaluators and serializes calls into each, routing
/// a new batch to whichever instance currently has the fewest
/// outstanding calls.
pub struct EvaluatorGateway {
    slots: Vec<Slot>,
    stats: GatewayStats,
}

impl EvaluatorGateway {
    pub fn new(evaluators: Vec<Box<dyn BatchedEvaluator>>) -> Self {
        assert!(!evaluators.is_empty(), "gateway needs at least one evaluator");
        let slots = evaluators
            .into_iter()
            .map(|evaluator| Slot { evaluator, lock: Mutex::new(()), in_flight: AtomicU64::new(0) })
            .collect();
        EvaluatorGateway { slots, stats: GatewayStats::default() }
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// The plane layout the Leaf Collector should encode positions into.
    /// All configured evaluator instances are expected to share one.
    pub fn input_dtype(&self) -> InputDtype {
        self.slots[0].evaluator.input_dtype()
    }

    fn pick_slot(&self) -> usize {
        self.slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.in_flight.load(Ordering::Relaxed))
            .map(|(i, _)| i)
            .expect("gateway always has at least one slot")
    }

    /// Evaluates `batch`, padding it up to the chosen evaluator's
    /// minimum batch size and slicing that padding back off the
    /// results. Retries once at half the batch size (the first half of
    /// real requests) if the first attempt fails.
    pub fn evaluate(&self, batch: &EvalBatch) -> Result<Vec<EvalResult>, SearchError> {
        let slot_idx = self.pick_slot();
        let slot = &self.slots[slot_idx];
        slot.in_flight.fetch_add(1, Ordering::Relaxed);
        let result = self.evaluate_on(slot, batch);
        slot.in_flight.fetch_sub(1, Ordering::Relaxed);
        result
    }

    fn evaluate_on(&self, slot: &Slot, batch: &EvalBatch) -> Result<Vec<EvalResult>, SearchError> {
        let _guard = slot.lock.lock();
        let start = Instant::now();

        let padded = pad_batch(batch, slot.evaluator.min_batch_size());
        match slot.evaluator.evaluate(&padded) {
            Ok(results) => {
                self.stats.record(batch.real_len, start.elapsed());
                Ok(results.into_iter().take(batch.real_len).collect())
            }
            Err(err) => {
                warn!(error = %err, "evaluator call failed, retrying at half batch size");
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                let half_len = (batch.real_len / 2).max(1).min(batch.real_len);
                if half_len == 0 {
                    return Err(err);
                }
                let half = EvalBatch { requests: batch.requests[..half_len].to_vec(), real_len: half_len };
                let padded_half = pad_batch(&half, slot.evaluator.min_batch_size());
                let results = slot.evaluator.evaluate(&padded_half)?;
                self.stats.record(half_len, start.elapsed());
                Ok(results.into_iter().take(half_len).collect())
            }
        }
    }
}

/// Pads `batch` with clones of its first request up to `min_size`, a
/// no-op if it's already at least that large.
fn pad_batch(batch: &EvalBatch, min_size: usize) -> EvalBatch {
    if batch.requests.len() >= min_size || batch.requests.is_empty() {
        return EvalBatch { requests: batch.requests.clone(), real_len: batch.real_len };
    }
    let mut requests = batch.requests.clone();
    let filler = requests[0].clone();
    while requests.len() < min_size {
        requests.push(filler.clone());
    }
    EvalBatch { requests, real_len: batch.real_len }
}

//! The `BatchedEvaluator` capability consumed by the Evaluator Gateway.
//!
//! Neural-network inference is an external collaborator; this module
//! only names the trait boundary and the result shape, so the search
//! core stays agnostic to whatever network and runtime backs it.

use crate::error::SearchError;
use crate::position::{EncodedMove, InputDtype, PositionPlanes};

/// One position queued for evaluation, carrying enough context for the
/// gateway to route its result back to the right leaf.
#[derive(Clone)]
pub struct EvalRequest {
    pub planes: PositionPlanes,
    pub legal_moves: Vec<EncodedMove>,
}

/// A dense batch assembled by the Leaf Collector and handed to a
/// `BatchedEvaluator`. Padding entries (added to satisfy
/// `min_batch_size`) are appended after all real requests; the gateway
/// slices them back off before returning results.
pub struct EvalBatch {
    pub requests: Vec<EvalRequest>,
    /// Number of entries in `requests` that are real (not padding).
    pub real_len: usize,
}

impl EvalBatch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Per-position result produced by a `BatchedEvaluator`: a WDL pair, a
/// policy vector over the position's own legal moves, a moves-left
/// estimate, and value/policy uncertainty.
#[derive(Debug, Clone)]
pub struct EvalResult {
    /// P(win) for the side to move.
    pub win_prob: f32,
    /// P(loss) for the side to move. `1 - win - loss` is the draw mass.
    pub loss_prob: f32,
    /// Prior probability per legal move, in the same order as the
    /// `legal_moves` passed in the corresponding `EvalRequest`.
    pub policy: Vec<f32>,
    pub moves_left: f32,
    pub value_uncertainty: f32,
    pub policy_uncertainty: f32,
    /// Optional secondary value head, for evaluators that expose one.
    pub secondary_value: Option<f32>,
}

impl EvalResult {
    /// Q = P(win) - P(loss), the WDL-derived scalar value.
    pub fn q(&self) -> f32 {
        self.win_prob - self.loss_prob
    }
}

/// A batched neural-network evaluator. Implementations are not assumed
/// to support concurrent `evaluate` calls; the gateway serializes access
/// per instance and routes across instances when more than one is
/// configured.
pub trait BatchedEvaluator: Send + Sync {
    /// The plane layout this evaluator expects its inputs in.
    fn input_dtype(&self) -> InputDtype;

    /// Largest batch this evaluator accepts in one call.
    fn max_batch_size(&self) -> usize;

    /// Smallest batch size below which accelerator kernels are known to
    /// misbehave; the gateway pads up to this size before calling.
    fn min_batch_size(&self) -> usize;

    /// Runs inference on `batch`, returning one `EvalResult` per entry
    /// (including padding entries, which the gateway discards).
    fn evaluate(&self, batch: &EvalBatch) -> Result<Vec<EvalResult>, SearchError>;
}

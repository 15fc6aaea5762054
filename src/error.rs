//! Crate-wide error type.
//!
//! The core only ever surfaces a handful of error kinds to its caller;
//! most internal bookkeeping (virtual-loss underflow, hash mismatches)
//! is a programmer error and asserts instead.

use thiserror::Error;

/// Errors surfaced by the search engine to its driver/caller.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The node arena or a child-row arena ran out of capacity.
    #[error("node arena exhausted (capacity {capacity})")]
    CapacityExhausted {
        /// The configured `max_nodes` that was exceeded.
        capacity: u32,
    },

    /// A `BatchedEvaluator` call failed or returned non-finite output.
    #[error("evaluator failure: {0}")]
    EvaluatorFailure(String),

    /// A debug-only invariant was violated. In release builds this is
    /// surfaced as an error instead of panicking so a host process can
    /// log and exit cleanly; in debug builds `debug_assert!` fires first.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),

    /// `search()` was called on a position with no legal moves.
    #[error("root position has no legal moves")]
    NoLegalMoves,
}

pub type SearchOutcome<T> = Result<T, SearchError>;

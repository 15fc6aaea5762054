//! A neural-network-guided PUCT/MCTS search core for two-player,
//! perfect-information games.
//!
//! The crate owns tree search: a lock-free node arena, PUCT selection
//! with virtual loss, batched leaf evaluation, and backup. It knows
//! nothing about chess (or any other game) rules — move generation,
//! board representation and position hashing are supplied by a
//! [`position::PositionOps`] implementation, and neural-network
//! inference by a [`evaluator::BatchedEvaluator`] implementation.
//! [`driver::SearchDriver`] is the entry point most callers want.

mod backup;
pub mod config;
pub mod driver;
pub mod error;
pub mod evaluator;
pub mod evaluator_gateway;
mod leaf_collector;
mod node_store;
mod selector;
mod worker;
pub mod position;

pub use config::{BestMoveSelection, SearchConfig, SearchLimit};
pub use driver::{RootChildReport, SearchDriver, SearchHandle, SearchResult, SearchStatus};
pub use error::{SearchError, SearchOutcome};
pub use evaluator::{BatchedEvaluator, EvalBatch, EvalRequest, EvalResult};
pub use evaluator_gateway::GatewayStats;
pub use position::{EncodedMove, InputDtype, PositionOps, PositionPlanes, TerminalStatus};

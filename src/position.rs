//! The `PositionOps` capability consumed by the selector and leaf collector.
//!
//! Move generation, board representation and hashing are supplied by the
//! caller; this module only names the trait boundary so the search core
//! never hard-codes a single game implementation.

use std::fmt;

/// An opaque, engine-encoded move. The core never interprets the bits;
/// it only stores them in child rows and hands them back to
/// `PositionOps::apply_move` and the evaluator's policy decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EncodedMove(pub u16);

impl fmt::Display for EncodedMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// `NotTerminal` nodes may still expand; every other variant is a fixed,
/// final value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    NotTerminal,
    Checkmate,
    Draw50,
    DrawRepetition,
    DrawInsufficient,
    DrawStalemate,
    TablebaseWin,
    TablebaseLoss,
    TablebaseDraw,
}

impl TerminalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TerminalStatus::NotTerminal)
    }

    /// The win/loss/draw value of a terminal position from the mover's
    /// perspective at that node, in `[-1.0, 1.0]`. Panics on
    /// `NotTerminal`, which is a caller error.
    pub fn terminal_value(self) -> f32 {
        match self {
            TerminalStatus::NotTerminal => {
                unreachable!("terminal_value() called on a non-terminal status")
            }
            TerminalStatus::Checkmate | TerminalStatus::TablebaseLoss => -1.0,
            TerminalStatus::TablebaseWin => 1.0,
            TerminalStatus::Draw50
            | TerminalStatus::DrawRepetition
            | TerminalStatus::DrawInsufficient
            | TerminalStatus::DrawStalemate
            | TerminalStatus::TablebaseDraw => 0.0,
        }
    }
}

/// Declares which plane representation a `BatchedEvaluator` expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDtype {
    F32,
    U8,
}

/// The encoded planes for a single position, in whichever layout the
/// evaluator declared via `BatchedEvaluator::input_dtype`.
#[derive(Debug, Clone)]
pub enum PositionPlanes {
    F32(Vec<f32>),
    U8(Vec<u8>),
}

impl PositionPlanes {
    pub fn len(&self) -> usize {
        match self {
            PositionPlanes::F32(v) => v.len(),
            PositionPlanes::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The external collaborator boundary for chess rules. Implementations
/// are expected to be cheap to clone (an immutable-update board
/// representation) since the selector clones positions freely while
/// replaying paths.
pub trait PositionOps: Clone + Send + Sync + 'static {
    /// Applies a move, returning the resulting position. Never mutates
    /// `self`; concurrent leaf-path replays each hold an independent
    /// clone, so no unmake/undo path is required.
    fn apply_move(&self, mv: EncodedMove) -> Self;

    /// All legal moves from this position, in a stable, implementation-
    /// defined order. The selector tie-breaks on the lowest index in
    /// this list, so the order must be deterministic for
    /// single-threaded reproducibility.
    fn legal_moves(&self) -> Vec<EncodedMove>;

    /// Checkmate / draw / tablebase classification of this position.
    fn terminal_status(&self) -> TerminalStatus;

    /// 96-bit position hash, split into a 64-bit and a 32-bit half so it
    /// can be stored in two lock-free atomics per node.
    fn zobrist_hash(&self) -> (u64, u32);

    /// Encodes this position into the plane layout the evaluator wants.
    fn encode(&self, dtype: InputDtype) -> PositionPlanes;
}

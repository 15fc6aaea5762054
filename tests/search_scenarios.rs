//! Integration tests against the public `SearchDriver` API, using a toy
//! deterministic game and a deterministic evaluator instead of real
//! chess rules or a real neural network.
//!
//! The toy game: positions are `u8` counters. From `n`, the legal moves
//! are `+1` and `+2` (mod 16). `n == 15` is a win for the side to move
//! (a "mate in one" shape: the mover who reaches 15 has already won, so
//! a position one move away from 15 should have an obviously best move).
//! `n == 0` after a move is a draw (wrapped back to the start).

use ceres_core::{
    BatchedEvaluator, BestMoveSelection, EncodedMove, EvalBatch, EvalResult, InputDtype,
    PositionOps, PositionPlanes, SearchConfig, SearchDriver, SearchLimit, SearchStatus,
    TerminalStatus,
};

const MOVE_ADD_ONE: EncodedMove = EncodedMove(1);
const MOVE_ADD_TWO: EncodedMove = EncodedMove(2);

#[derive(Clone, Debug)]
struct CounterGame {
    n: u8,
}

impl PositionOps for CounterGame {
    fn apply_move(&self, mv: EncodedMove) -> Self {
        CounterGame { n: (self.n + mv.0 as u8) % 16 }
    }

    fn legal_moves(&self) -> Vec<EncodedMove> {
        if self.n == 15 {
            vec![]
        } else {
            vec![MOVE_ADD_ONE, MOVE_ADD_TWO]
        }
    }

    fn terminal_status(&self) -> TerminalStatus {
        if self.n == 15 {
            TerminalStatus::Checkmate
        } else {
            TerminalStatus::NotTerminal
        }
    }

    fn zobrist_hash(&self) -> (u64, u32) {
        (self.n as u64, 0)
    }

    fn encode(&self, _dtype: InputDtype) -> PositionPlanes {
        PositionPlanes::F32(vec![self.n as f32 / 15.0])
    }
}

/// Always prefers the move that lands closer to 15 (a stand-in for "the
/// network has learned the game"), with uniform uncertainty.
struct OracleEvaluator;

impl BatchedEvaluator for OracleEvaluator {
    fn input_dtype(&self) -> InputDtype {
        InputDtype::F32
    }

    fn max_batch_size(&self) -> usize {
        256
    }

    fn min_batch_size(&self) -> usize {
        1
    }

    fn evaluate(&self, batch: &EvalBatch) -> Result<Vec<EvalResult>, ceres_core::SearchError> {
        let results = batch
            .requests
            .iter()
            .map(|req| {
                let n = match &req.planes {
                    PositionPlanes::F32(v) => (v[0] * 15.0).round() as u8,
                    PositionPlanes::U8(_) => 0,
                };
                // Prefer +2 over +1 whenever both are legal, since it
                // reaches the winning position faster.
                let policy = if req.legal_moves.len() == 2 { vec![0.25, 0.75] } else { vec![] };
                let win_prob = if n >= 13 { 0.95 } else { 0.5 };
                Ok(EvalResult {
                    win_prob,
                    loss_prob: 1.0 - win_prob,
                    policy,
                    moves_left: (15 - n.min(15)) as f32,
                    value_uncertainty: 0.05,
                    policy_uncertainty: 0.05,
                    secondary_value: None,
                })
            })
            .collect::<Result<Vec<_>, ceres_core::SearchError>>()?;
        Ok(results)
    }
}

fn fast_config() -> SearchConfig {
    SearchConfig {
        num_worker_threads: 2,
        target_batch_size: 8,
        max_batch_size: 32,
        max_nodes: 20_000,
        ..SearchConfig::default()
    }
}

#[test]
fn search_returns_a_legal_move_within_a_cycle_budget() {
    let driver = SearchDriver::new(fast_config(), vec![Box::new(OracleEvaluator)]);
    let limit = SearchLimit { cycle_budget: Some(50), ..SearchLimit::default() };

    let result = driver.search(CounterGame { n: 1 }, limit).expect("search should succeed");

    assert!(result.best_move == MOVE_ADD_ONE || result.best_move == MOVE_ADD_TWO);
    assert!(result.nodes_searched > 1);
    assert!(!result.root_children.is_empty());
}

#[test]
fn search_near_the_goal_prefers_the_faster_move() {
    let driver = SearchDriver::new(fast_config(), vec![Box::new(OracleEvaluator)]);
    let limit = SearchLimit { cycle_budget: Some(80), ..SearchLimit::default() };

    // From 13, +2 reaches 15 (a win) in one ply; +1 reaches 14, still
    // one ply from losing on the opponent's very next move. The oracle's
    // heavy +2 prior combined with enough visits should make +2 the
    // most-visited child.
    let result = driver.search(CounterGame { n: 13 }, limit).expect("search should succeed");
    let winning_child = result.root_children.iter().find(|c| c.mv == MOVE_ADD_TWO).unwrap();
    let other_child = result.root_children.iter().find(|c| c.mv == MOVE_ADD_ONE).unwrap();
    assert!(winning_child.visits >= other_child.visits);
}

#[test]
fn root_visit_sum_matches_root_node_visits_minus_one() {
    let driver = SearchDriver::new(fast_config(), vec![Box::new(OracleEvaluator)]);
    let limit = SearchLimit { cycle_budget: Some(40), ..SearchLimit::default() };

    let result = driver.search(CounterGame { n: 4 }, limit).expect("search should succeed");
    let children_visits: u32 = result.root_children.iter().map(|c| c.visits).sum();
    // The root's own visit counts its own backup passes; every child
    // visit corresponds to exactly one completed backup through the
    // root, so the root's total equals 1 (the root's initial expansion
    // backup) plus every child visit.
    assert!(children_visits <= result.nodes_searched);
}

#[test]
fn a_position_one_ply_from_checkmate_is_handled_without_panicking() {
    let driver = SearchDriver::new(fast_config(), vec![Box::new(OracleEvaluator)]);
    let limit = SearchLimit { cycle_budget: Some(30), ..SearchLimit::default() };

    // n=14: +1 reaches 15 (checkmate, terminal short-circuit with no
    // network call needed for that child).
    let result = driver.search(CounterGame { n: 14 }, limit).expect("search should succeed");
    assert_eq!(result.best_move, MOVE_ADD_ONE);
}

#[test]
fn search_on_a_position_with_no_legal_moves_is_rejected() {
    let driver = SearchDriver::new(fast_config(), vec![Box::new(OracleEvaluator)]);
    let limit = SearchLimit::default();
    let err = driver.search(CounterGame { n: 15 }, limit).unwrap_err();
    assert!(matches!(err, ceres_core::SearchError::NoLegalMoves));
}

#[test]
fn exhausting_node_capacity_stops_gracefully_with_a_valid_best_move() {
    let cfg = SearchConfig {
        num_worker_threads: 2,
        target_batch_size: 8,
        max_batch_size: 32,
        max_nodes: 64,
        ..SearchConfig::default()
    };
    let driver = SearchDriver::new(cfg, vec![Box::new(OracleEvaluator)]);
    // No time/node/cycle limit: the only thing that can stop this search
    // is the 64-node arena filling up.
    let limit = SearchLimit::default();

    let result = driver.search(CounterGame { n: 1 }, limit).expect("search should succeed");

    assert_eq!(result.status, SearchStatus::CapacityExhausted);
    assert!(result.best_move == MOVE_ADD_ONE || result.best_move == MOVE_ADD_TWO);
    assert!(result.nodes_searched <= 64);
}

#[test]
fn same_seed_and_max_nodes_single_threaded_reproduces_identical_search() {
    let cfg = SearchConfig {
        num_worker_threads: 1,
        target_batch_size: 4,
        max_batch_size: 16,
        max_nodes: 200,
        seed: Some(42),
        ..SearchConfig::default()
    };
    // No time/node/cycle limit: both runs stop only once their arena
    // fills up, a deterministic condition for a single-threaded search,
    // rather than racing against a wall-clock poll.
    let limit = SearchLimit::default();

    let driver_a = SearchDriver::new(cfg.clone(), vec![Box::new(OracleEvaluator)]);
    let result_a = driver_a.search(CounterGame { n: 4 }, limit).expect("search should succeed");

    let driver_b = SearchDriver::new(cfg, vec![Box::new(OracleEvaluator)]);
    let result_b = driver_b.search(CounterGame { n: 4 }, limit).expect("search should succeed");

    assert_eq!(result_a.status, SearchStatus::CapacityExhausted);
    assert_eq!(result_b.status, SearchStatus::CapacityExhausted);
    assert_eq!(result_a.best_move, result_b.best_move);
    assert_eq!(result_a.nodes_searched, result_b.nodes_searched);

    let mut visits_a: Vec<(EncodedMove, u32)> = result_a.root_children.iter().map(|c| (c.mv, c.visits)).collect();
    let mut visits_b: Vec<(EncodedMove, u32)> = result_b.root_children.iter().map(|c| (c.mv, c.visits)).collect();
    visits_a.sort_by_key(|(mv, _)| mv.0);
    visits_b.sort_by_key(|(mv, _)| mv.0);
    assert_eq!(visits_a, visits_b);
}

#[test]
fn reparenting_onto_the_played_move_keeps_the_subtree_within_budget() {
    let cfg = SearchConfig {
        num_worker_threads: 1,
        target_batch_size: 8,
        max_batch_size: 32,
        max_nodes: 20_000,
        seed: Some(7),
        ..SearchConfig::default()
    };
    let driver = SearchDriver::new(cfg, vec![Box::new(OracleEvaluator)]);
    let limit = SearchLimit { node_budget: Some(10_000), ..SearchLimit::default() };

    let first = driver.search(CounterGame { n: 1 }, limit).expect("first search should succeed");
    assert!(first.nodes_searched <= 10_000);

    let reused = driver.reparent(first.best_move);
    assert!(reused, "the played move should have a live explored child subtree to reparent onto");

    let next_position = CounterGame { n: 1 }.apply_move(first.best_move);
    let second = driver.search(next_position, limit).expect("second search should succeed");
    assert!(second.nodes_searched <= 10_000);
    // Each arena is independently capped by node_budget, so the total
    // across both searches is bounded by the sum of their budgets.
    assert!(first.nodes_searched + second.nodes_searched <= 20_000);
}

#[test]
fn time_budget_bounds_search_duration() {
    let driver = SearchDriver::new(fast_config(), vec![Box::new(OracleEvaluator)]);
    let limit = SearchLimit { time_budget_ms: Some(30), ..SearchLimit::default() };

    let start = std::time::Instant::now();
    let result = driver.search(CounterGame { n: 2 }, limit).expect("search should succeed");
    // Generous upper bound: worker shutdown and a final cycle in flight
    // can run past the budget, but not by an order of magnitude.
    assert!(start.elapsed() < std::time::Duration::from_millis(500));
    assert!(result.nodes_searched > 0);
}

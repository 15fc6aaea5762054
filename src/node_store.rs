//! The node arena: a fixed-capacity, append-only store of packed MCTS
//! node records, their child rows, and the transposition index.
//!
//! Every mutable field is an atomic so worker threads can read and
//! update nodes through a shared reference with no tree-wide lock:
//! allocation is a monotonic counter bump, expansion is a CAS from an
//! "unexpanded" sentinel, and the handful of stats that must be read
//! or written together sit behind a per-node spinlock.

use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicI64, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering,
};

use tracing::warn;

use crate::error::SearchError;
use crate::position::{EncodedMove, TerminalStatus};

/// Index of a node in the arena. `NONE` marks "no node" (e.g. a root's
/// parent, or an unresolved child slot).
pub type NodeIdx = u32;
pub const NONE: NodeIdx = u32::MAX;

/// Index of the first entry of a child row in the row arena.
pub type RowIdx = u32;
pub const NO_ROW: RowIdx = u32::MAX;

const UNEXPANDED: i64 = -1;
const EXPANDING: i64 = -2;

/// Fixed-point scale for value/moves-left sums stored as `AtomicI64`.
const VALUE_SCALE: f64 = (1u64 << 30) as f64;

fn terminal_to_u8(status: TerminalStatus) -> u8 {
    match status {
        TerminalStatus::NotTerminal => 0,
        TerminalStatus::Checkmate => 1,
        TerminalStatus::Draw50 => 2,
        TerminalStatus::DrawRepetition => 3,
        TerminalStatus::DrawInsufficient => 4,
        TerminalStatus::DrawStalemate => 5,
        TerminalStatus::TablebaseWin => 6,
        TerminalStatus::TablebaseLoss => 7,
        TerminalStatus::TablebaseDraw => 8,
    }
}

fn u8_to_terminal(v: u8) -> TerminalStatus {
    match v {
        1 => TerminalStatus::Checkmate,
        2 => TerminalStatus::Draw50,
        3 => TerminalStatus::DrawRepetition,
        4 => TerminalStatus::DrawInsufficient,
        5 => TerminalStatus::DrawStalemate,
        6 => TerminalStatus::TablebaseWin,
        7 => TerminalStatus::TablebaseLoss,
        8 => TerminalStatus::TablebaseDraw,
        _ => TerminalStatus::NotTerminal,
    }
}

/// A packed MCTS node record. Every field is an atomic so readers never
/// race with concurrent Backup/expansion writers; `parent`,
/// `action_from_parent` and the hash are written once before the node
/// is published into a child slot and are never mutated afterward, so
/// they're stored as plain fields.
pub struct NodeRecord {
    /// `NONE` for the root. Written once at allocation time, before the
    /// node index is ever handed to another thread; later cross-thread
    /// visibility is piggybacked on the `Release` store that publishes
    /// this node into a child slot (`ChildEntry::set_child`).
    parent: AtomicU32,
    /// Encoded as `-1` for "no move" (root), else the move's `u16` bits.
    action_from_parent: AtomicI32,
    hash_lo: AtomicU64,
    hash_hi: AtomicU32,

    /// Packed (row index) of this node's child row, or `UNEXPANDED`/
    /// `EXPANDING`. Published with `Release`; read with `Acquire`.
    child_row: AtomicI64,
    num_children: AtomicU32,

    visits: AtomicU32,
    virtual_loss: AtomicI32,

    /// Guards `value_sum`/`value_sq_sum`/`moves_left_sum` so the triple
    /// is observed and updated atomically together. A per-node spinlock
    /// is cheap here since contention on any one node is expected to be
    /// rare relative to the size of the tree.
    stat_lock: AtomicBool,
    value_sum_fx: AtomicI64,
    value_sq_sum_fx: AtomicI64,
    moves_left_sum_fx: AtomicI64,

    terminal: AtomicU8,
    value_uncertainty_bits: AtomicU32,
    policy_uncertainty_bits: AtomicU32,
    secondary_value_bits: AtomicU32,
    has_secondary_value: AtomicBool,
}

impl NodeRecord {
    fn empty_slot() -> Self {
        NodeRecord {
            parent: AtomicU32::new(NONE),
            action_from_parent: AtomicI32::new(-1),
            hash_lo: AtomicU64::new(0),
            hash_hi: AtomicU32::new(0),
            child_row: AtomicI64::new(UNEXPANDED),
            num_children: AtomicU32::new(0),
            visits: AtomicU32::new(0),
            virtual_loss: AtomicI32::new(0),
            stat_lock: AtomicBool::new(false),
            value_sum_fx: AtomicI64::new(0),
            value_sq_sum_fx: AtomicI64::new(0),
            moves_left_sum_fx: AtomicI64::new(0),
            terminal: AtomicU8::new(0),
            value_uncertainty_bits: AtomicU32::new(0),
            policy_uncertainty_bits: AtomicU32::new(0),
            secondary_value_bits: AtomicU32::new(0),
            has_secondary_value: AtomicBool::new(false),
        }
    }

    /// Re-initializes a freshly bump-allocated slot. Safe to call with
    /// only a shared reference: the bump counter in `NodeStore` hands
    /// each index to exactly one caller, so no other thread touches
    /// this slot's identity fields concurrently with this call.
    fn reinit(&self, parent: NodeIdx, action: Option<EncodedMove>, hash: (u64, u32)) {
        self.parent.store(parent, Ordering::Relaxed);
        self.action_from_parent
            .store(action.map_or(-1, |m| m.0 as i32), Ordering::Relaxed);
        self.hash_lo.store(hash.0, Ordering::Relaxed);
        self.hash_hi.store(hash.1, Ordering::Relaxed);
        self.child_row.store(UNEXPANDED, Ordering::Relaxed);
        self.num_children.store(0, Ordering::Relaxed);
        self.visits.store(0, Ordering::Relaxed);
        self.virtual_loss.store(0, Ordering::Relaxed);
        self.value_sum_fx.store(0, Ordering::Relaxed);
        self.value_sq_sum_fx.store(0, Ordering::Relaxed);
        self.moves_left_sum_fx.store(0, Ordering::Relaxed);
        self.terminal.store(0, Ordering::Relaxed);
        self.has_secondary_value.store(false, Ordering::Relaxed);
        // Publishing ordering is supplied by the caller: `alloc_node`
        // only hands `idx` to other threads via a later `Release` store
        // (`link_child`/`publish_child_row`), which happens-after all
        // of the above in program order on this thread.
    }

    pub fn parent(&self) -> NodeIdx {
        self.parent.load(Ordering::Relaxed)
    }

    pub fn action_from_parent(&self) -> Option<EncodedMove> {
        let v = self.action_from_parent.load(Ordering::Relaxed);
        if v < 0 {
            None
        } else {
            Some(EncodedMove(v as u16))
        }
    }

    pub fn hash(&self) -> (u64, u32) {
        (self.hash_lo.load(Ordering::Relaxed), self.hash_hi.load(Ordering::Relaxed))
    }

    pub fn visits(&self) -> u32 {
        self.visits.load(Ordering::Acquire)
    }

    pub fn virtual_loss(&self) -> i32 {
        self.virtual_loss.load(Ordering::Acquire)
    }

    /// Mean backed-up value, from this node's own perspective, in
    /// `[-1, 1]`. Zero for an unvisited node.
    pub fn mean_value(&self) -> f64 {
        let n = self.visits();
        if n == 0 {
            0.0
        } else {
            let _g = self.lock_stats();
            self.value_sum_fx.load(Ordering::Relaxed) as f64 / VALUE_SCALE / n as f64
        }
    }

    /// Sample variance of backed-up values, used for uncertainty
    /// reporting and pessimistic move selection.
    pub fn value_variance(&self) -> f64 {
        let n = self.visits();
        if n < 2 {
            return 0.0;
        }
        let _g = self.lock_stats();
        let mean = self.value_sum_fx.load(Ordering::Relaxed) as f64 / VALUE_SCALE / n as f64;
        let mean_sq = self.value_sq_sum_fx.load(Ordering::Relaxed) as f64 / VALUE_SCALE / n as f64;
        (mean_sq - mean * mean).max(0.0)
    }

    pub fn moves_left_mean(&self) -> f64 {
        let n = self.visits();
        if n == 0 {
            0.0
        } else {
            let _g = self.lock_stats();
            self.moves_left_sum_fx.load(Ordering::Relaxed) as f64 / VALUE_SCALE / n as f64
        }
    }

    pub fn terminal_status(&self) -> TerminalStatus {
        u8_to_terminal(self.terminal.load(Ordering::Acquire))
    }

    pub fn set_terminal(&self, status: TerminalStatus) {
        self.terminal.store(terminal_to_u8(status), Ordering::Release);
    }

    pub fn value_uncertainty(&self) -> f32 {
        f32::from_bits(self.value_uncertainty_bits.load(Ordering::Relaxed))
    }

    pub fn set_value_uncertainty(&self, v: f32) {
        self.value_uncertainty_bits.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn policy_uncertainty(&self) -> f32 {
        f32::from_bits(self.policy_uncertainty_bits.load(Ordering::Relaxed))
    }

    pub fn set_policy_uncertainty(&self, v: f32) {
        self.policy_uncertainty_bits.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn secondary_value(&self) -> Option<f32> {
        if self.has_secondary_value.load(Ordering::Relaxed) {
            Some(f32::from_bits(self.secondary_value_bits.load(Ordering::Relaxed)))
        } else {
            None
        }
    }

    pub fn set_secondary_value(&self, v: f32) {
        self.secondary_value_bits.store(v.to_bits(), Ordering::Relaxed);
        self.has_secondary_value.store(true, Ordering::Release);
    }

    /// Is this node expanded (has a published child row)?
    pub fn is_expanded(&self) -> bool {
        self.child_row.load(Ordering::Acquire) >= 0
    }

    pub fn child_row(&self) -> Option<(RowIdx, u32)> {
        let row = self.child_row.load(Ordering::Acquire);
        if row >= 0 {
            Some((row as RowIdx, self.num_children.load(Ordering::Relaxed)))
        } else {
            None
        }
    }

    /// Attempts to become the single expander of this node. Returns
    /// `true` if this call won the race; the loser must spin/yield
    /// until `child_row()` becomes `Some`.
    fn try_claim_expansion(&self) -> bool {
        self.child_row
            .compare_exchange(UNEXPANDED, EXPANDING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publishes the winning expander's child row. Must be called
    /// exactly once, after `try_claim_expansion` succeeded.
    fn publish_child_row(&self, row: RowIdx, num_children: u32) {
        self.num_children.store(num_children, Ordering::Relaxed);
        self.child_row.store(row as i64, Ordering::Release);
    }

    fn lock_stats(&self) -> StatGuard<'_> {
        while self
            .stat_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        StatGuard { lock: &self.stat_lock }
    }

    /// Applies one backup step: increments N and adds `value`/`value^2`
    /// and `moves_left` to their running sums. Does not touch virtual
    /// loss; callers remove it separately via `remove_virtual_loss` once
    /// backup has made the real stats visible.
    pub fn apply_backup(&self, value: f64, moves_left: f64) {
        {
            let _g = self.lock_stats();
            self.value_sum_fx.fetch_add((value * VALUE_SCALE) as i64, Ordering::Relaxed);
            self.value_sq_sum_fx
                .fetch_add(((value * value) * VALUE_SCALE) as i64, Ordering::Relaxed);
            self.moves_left_sum_fx
                .fetch_add((moves_left * VALUE_SCALE) as i64, Ordering::Relaxed);
        }
        self.visits.fetch_add(1, Ordering::AcqRel);
    }

    /// Raw fixed-point accumulators backing `mean_value`/`value_variance`/
    /// `moves_left_mean`, for copying one node's accumulated stats onto
    /// another record (reparenting) without replaying every backup.
    pub fn raw_stats(&self) -> (u32, i64, i64, i64) {
        let _g = self.lock_stats();
        (
            self.visits.load(Ordering::Relaxed),
            self.value_sum_fx.load(Ordering::Relaxed),
            self.value_sq_sum_fx.load(Ordering::Relaxed),
            self.moves_left_sum_fx.load(Ordering::Relaxed),
        )
    }

    /// Overwrites this node's accumulated stats in bulk. Only safe on a
    /// freshly allocated node not yet published into a child slot.
    pub fn set_raw_stats(&self, visits: u32, value_sum_fx: i64, value_sq_sum_fx: i64, moves_left_sum_fx: i64) {
        self.visits.store(visits, Ordering::Relaxed);
        self.value_sum_fx.store(value_sum_fx, Ordering::Relaxed);
        self.value_sq_sum_fx.store(value_sq_sum_fx, Ordering::Relaxed);
        self.moves_left_sum_fx.store(moves_left_sum_fx, Ordering::Relaxed);
    }

    pub fn add_virtual_loss(&self, amount: i32) {
        self.virtual_loss.fetch_add(amount, Ordering::AcqRel);
    }

    /// Reverses virtual loss applied during selection. `Release` so a
    /// selector that observes the lowered count also observes the
    /// backup's updated N/sum.
    pub fn remove_virtual_loss(&self, amount: i32) {
        let prev = self.virtual_loss.fetch_sub(amount, Ordering::Release);
        debug_assert!(prev >= amount, "virtual loss underflow");
    }
}

struct StatGuard<'a> {
    lock: &'a AtomicBool,
}

impl<'a> Drop for StatGuard<'a> {
    fn drop(&mut self) {
        self.lock.store(false, Ordering::Release);
    }
}

/// One entry of a child row: an encoded move, its fixed-point prior
/// probability, and the (possibly not-yet-expanded) child node index.
pub struct ChildEntry {
    encoded_move: AtomicU16,
    prior_q16: AtomicU16,
    child: AtomicI32,
}

impl ChildEntry {
    fn empty() -> Self {
        ChildEntry {
            encoded_move: AtomicU16::new(0),
            prior_q16: AtomicU16::new(0),
            child: AtomicI32::new(-1),
        }
    }

    pub fn encoded_move(&self) -> EncodedMove {
        EncodedMove(self.encoded_move.load(Ordering::Relaxed))
    }

    /// Prior probability as a float in `[0, 1]`.
    pub fn prior(&self) -> f32 {
        self.prior_q16.load(Ordering::Relaxed) as f32 / u16::MAX as f32
    }

    pub fn child(&self) -> Option<NodeIdx> {
        let v = self.child.load(Ordering::Acquire);
        if v < 0 {
            None
        } else {
            Some(v as NodeIdx)
        }
    }

    fn init(&self, mv: EncodedMove, prior: f32) {
        self.encoded_move.store(mv.0, Ordering::Relaxed);
        self.prior_q16
            .store((prior.clamp(0.0, 1.0) * u16::MAX as f32).round() as u16, Ordering::Relaxed);
    }

    /// Tries to become the thread responsible for allocating this
    /// slot's child node, since two concurrent selectors can land on
    /// the same unexpanded slot before either allocates its node.
    pub fn try_claim(&self) -> bool {
        self.child.compare_exchange(-1, -2, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Publishes a freshly allocated child node into this slot, after
    /// `try_claim` succeeded. `Release` ordering pairs with the
    /// `Acquire` load in `child()`.
    pub fn publish_child(&self, idx: NodeIdx) {
        self.child.store(idx as i32, Ordering::Release);
    }
}

const TT_EMPTY: i64 = -1;
const TT_RESERVED: i64 = -2;

struct TtSlot {
    hash_lo: AtomicU64,
    hash_hi: AtomicU32,
    node_idx: AtomicI64,
}

impl TtSlot {
    fn empty() -> Self {
        TtSlot {
            hash_lo: AtomicU64::new(0),
            hash_hi: AtomicU32::new(0),
            node_idx: AtomicI64::new(TT_EMPTY),
        }
    }
}

/// Lock-free, open-addressed transposition index mapping a 96-bit
/// position hash to the authoritative node index.
pub struct TranspositionIndex {
    slots: Vec<TtSlot>,
    mask: usize,
}

impl TranspositionIndex {
    fn new(capacity_pow2: usize) -> Self {
        let capacity = capacity_pow2.next_power_of_two().max(16);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, TtSlot::empty);
        TranspositionIndex { slots, mask: capacity - 1 }
    }

    fn start(&self, hash_lo: u64) -> usize {
        (hash_lo as usize) & self.mask
    }

    /// Looks up `hash`, returning the node index if present. Lock-free:
    /// never blocks, but may briefly re-read a slot mid-insertion.
    pub fn lookup(&self, hash: (u64, u32)) -> Option<NodeIdx> {
        let mut idx = self.start(hash.0);
        for _ in 0..self.slots.len() {
            let slot = &self.slots[idx];
            let node = slot.node_idx.load(Ordering::Acquire);
            if node == TT_EMPTY {
                return None;
            }
            if node != TT_RESERVED {
                let lo = slot.hash_lo.load(Ordering::Relaxed);
                let hi = slot.hash_hi.load(Ordering::Relaxed);
                if lo == hash.0 && hi == hash.1 {
                    return Some(node as NodeIdx);
                }
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Inserts `hash -> idx` if the hash isn't already present. Returns
    /// the index now authoritative for `hash` (either the one just
    /// inserted, or a pre-existing entry that raced ahead of us).
    pub fn insert_or_get(&self, hash: (u64, u32), idx: NodeIdx) -> NodeIdx {
        let mut probe = self.start(hash.0);
        loop {
            let slot = &self.slots[probe];
            match slot.node_idx.compare_exchange(
                TT_EMPTY,
                TT_RESERVED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    slot.hash_lo.store(hash.0, Ordering::Relaxed);
                    slot.hash_hi.store(hash.1, Ordering::Relaxed);
                    slot.node_idx.store(idx as i64, Ordering::Release);
                    return idx;
                }
                Err(existing) => {
                    if existing == TT_RESERVED {
                        std::hint::spin_loop();
                        continue;
                    }
                    let lo = slot.hash_lo.load(Ordering::Relaxed);
                    let hi = slot.hash_hi.load(Ordering::Relaxed);
                    if lo == hash.0 && hi == hash.1 {
                        return existing as NodeIdx;
                    }
                    probe = (probe + 1) & self.mask;
                }
            }
        }
    }
}

/// Fixed-capacity arena of node records, child rows and the
/// transposition index. Grows only at construction time; exceeding
/// `capacity` mid-search is a hard error.
pub struct NodeStore {
    nodes: Vec<NodeRecord>,
    next_node: AtomicU32,
    capacity: u32,
    overflow: AtomicBool,

    rows: Vec<ChildEntry>,
    next_row: AtomicU32,
    row_capacity: u32,

    transposition: TranspositionIndex,
}

impl NodeStore {
    pub fn new(max_nodes: u32, avg_branching_factor: u32) -> Self {
        let mut nodes = Vec::with_capacity(max_nodes as usize);
        nodes.resize_with(max_nodes as usize, NodeRecord::empty_slot);

        let row_capacity = max_nodes.saturating_mul(avg_branching_factor.max(1));
        let mut rows = Vec::with_capacity(row_capacity as usize);
        rows.resize_with(row_capacity as usize, ChildEntry::empty);

        NodeStore {
            nodes,
            next_node: AtomicU32::new(0),
            capacity: max_nodes,
            overflow: AtomicBool::new(false),
            rows,
            next_row: AtomicU32::new(0),
            row_capacity,
            transposition: TranspositionIndex::new((max_nodes as usize).next_power_of_two()),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> u32 {
        self.next_node.load(Ordering::Acquire).min(self.capacity)
    }

    pub fn has_overflowed(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    pub fn node(&self, idx: NodeIdx) -> &NodeRecord {
        &self.nodes[idx as usize]
    }

    /// Allocates a root node with no parent.
    pub fn alloc_root(&self, hash: (u64, u32)) -> Result<NodeIdx, SearchError> {
        self.alloc_node(NONE, None, hash)
    }

    /// Allocates a new node. The slot's fields are written directly
    /// (the arena is preallocated with default atomics, so "allocating"
    /// just means claiming and overwriting a fresh slot via a
    /// monotonically increasing counter).
    pub fn alloc_node(
        &self,
        parent: NodeIdx,
        action: Option<EncodedMove>,
        hash: (u64, u32),
    ) -> Result<NodeIdx, SearchError> {
        let idx = self.next_node.fetch_add(1, Ordering::AcqRel);
        if idx >= self.capacity {
            self.overflow.store(true, Ordering::Release);
            return Err(SearchError::CapacityExhausted { capacity: self.capacity });
        }

        // Each slot is claimed by exactly one allocation (the bump
        // counter is unique per index), and every field is an atomic,
        // so re-initializing an already-live `Vec` slot through a
        // shared reference is race-free.
        self.nodes[idx as usize].reinit(parent, action, hash);

        Ok(idx)
    }

    /// Reserves `num_children` contiguous child-row slots from the row
    /// arena (a separate bump allocator, so variable-length rows don't
    /// fragment the fixed-size node arena).
    pub fn alloc_child_row(&self, num_children: u32) -> Result<RowIdx, SearchError> {
        if num_children == 0 {
            return Ok(NO_ROW);
        }
        let start = self.next_row.fetch_add(num_children, Ordering::AcqRel);
        if start.saturating_add(num_children) > self.row_capacity {
            self.overflow.store(true, Ordering::Release);
            return Err(SearchError::CapacityExhausted { capacity: self.row_capacity });
        }
        Ok(start)
    }

    pub fn child_entry(&self, row: RowIdx, i: u32) -> &ChildEntry {
        &self.rows[(row + i) as usize]
    }

    /// Initializes a child row's moves/priors, then publishes it onto
    /// `parent`. Only one thread ever reaches this for a given parent
    /// (the loser of `try_expand` waits instead).
    pub fn expand(
        &self,
        parent: NodeIdx,
        moves_and_priors: &[(EncodedMove, f32)],
    ) -> Result<RowIdx, SearchError> {
        let row = self.alloc_child_row(moves_and_priors.len() as u32)?;
        for (i, (mv, prior)) in moves_and_priors.iter().enumerate() {
            self.child_entry(row, i as u32).init(*mv, *prior);
        }
        self.node(parent).publish_child_row(row, moves_and_priors.len() as u32);
        Ok(row)
    }

    /// Tries to become the thread that expands `node`. Returns `Ok(true)`
    /// if this call won the race and must now call `expand`;
    /// `Ok(false)` if another thread already claimed it (the caller
    /// should spin/yield on `node(node_idx).child_row()`).
    pub fn try_claim_expansion(&self, node_idx: NodeIdx) -> bool {
        self.node(node_idx).try_claim_expansion()
    }

    /// Tries to become the thread responsible for allocating a node for
    /// child row slot `(row, i)`. A losing caller should spin/yield on
    /// `child_entry(row, i).child()` until the winner publishes it.
    pub fn try_claim_child_slot(&self, row: RowIdx, i: u32) -> bool {
        self.child_entry(row, i).try_claim()
    }

    /// Publishes `child_idx` as the concrete child node for child row
    /// slot `(row, i)`, after `try_claim_child_slot` won the race.
    pub fn link_child(&self, row: RowIdx, i: u32, child_idx: NodeIdx) {
        self.child_entry(row, i).publish_child(child_idx);
    }

    pub fn transposition_lookup(&self, hash: (u64, u32)) -> Option<NodeIdx> {
        self.transposition.lookup(hash)
    }

    pub fn transposition_insert_or_get(&self, hash: (u64, u32), idx: NodeIdx) -> NodeIdx {
        self.transposition.insert_or_get(hash, idx)
    }

    /// Builds a fresh, compact arena containing only the subtree reached
    /// from `old_root` by playing `move_played`, with that child as the
    /// new arena's root. A bump arena has no way to free earlier slots in
    /// place, so tree reuse across moves means copying the surviving
    /// subtree rather than reclaiming the rest of `self`.
    ///
    /// Returns `None` if `move_played` isn't among `old_root`'s expanded
    /// children, that child has no node allocated yet, or the copy would
    /// overflow the new arena's capacity — in all of those cases the
    /// caller should just start the next search from a fresh arena.
    pub fn reparent(
        &self,
        old_root: NodeIdx,
        move_played: EncodedMove,
        max_nodes: u32,
        avg_branching_factor: u32,
    ) -> Option<(NodeStore, NodeIdx)> {
        let (row, n) = self.node(old_root).child_row()?;
        let old_child = (0..n).find(|&i| self.child_entry(row, i).encoded_move() == move_played)?;
        let old_new_root = self.child_entry(row, old_child).child()?;

        let new_store = NodeStore::new(max_nodes, avg_branching_factor);
        match new_store.copy_subtree_from(self, old_new_root) {
            Ok(new_root) => Some((new_store, new_root)),
            Err(err) => {
                warn!(error = %err, "reparent copy exceeded new arena capacity, starting fresh instead");
                None
            }
        }
    }

    /// Copies the subtree rooted at `old_root` (in `old`) into `self` as
    /// a new root, carrying accumulated visit/value stats forward and
    /// resetting virtual loss to zero (it's per-search transient state,
    /// not carried between searches). Iterative rather than recursive:
    /// MCTS subtrees are bushy, not deep, but this keeps arena size from
    /// ever betting on call-stack depth.
    fn copy_subtree_from(&self, old: &NodeStore, old_root: NodeIdx) -> Result<NodeIdx, SearchError> {
        let old_node = old.node(old_root);
        let new_root = self.alloc_root(old_node.hash())?;
        copy_node_stats(old_node, self.node(new_root));
        self.transposition_insert_or_get(old_node.hash(), new_root);

        let mut stack = vec![(old_root, new_root)];
        while let Some((old_idx, new_idx)) = stack.pop() {
            let Some((row, n)) = old.node(old_idx).child_row() else { continue };
            let moves_and_priors: Vec<(EncodedMove, f32)> = (0..n)
                .map(|i| {
                    let entry = old.child_entry(row, i);
                    (entry.encoded_move(), entry.prior())
                })
                .collect();

            self.try_claim_expansion(new_idx);
            let new_row = self.expand(new_idx, &moves_and_priors)?;

            for i in 0..n {
                let Some(old_child) = old.child_entry(row, i).child() else { continue };
                let mv = old.child_entry(row, i).encoded_move();
                let child_node = old.node(old_child);
                let new_child = self.alloc_node(new_idx, Some(mv), child_node.hash())?;
                copy_node_stats(child_node, self.node(new_child));
                self.transposition_insert_or_get(child_node.hash(), new_child);
                self.link_child(new_row, i, new_child);
                stack.push((old_child, new_child));
            }
        }
        Ok(new_root)
    }
}

/// Copies a node's accumulated value/visit/uncertainty stats from `old`
/// to a freshly allocated `new` record. Does not touch identity fields
/// (`parent`, `action_from_parent`, hash) or virtual loss.
fn copy_node_stats(old: &NodeRecord, new: &NodeRecord) {
    let (visits, value_sum_fx, value_sq_sum_fx, moves_left_sum_fx) = old.raw_stats();
    new.set_raw_stats(visits, value_sum_fx, value_sq_sum_fx, moves_left_sum_fx);
    new.set_terminal(old.terminal_status());
    new.set_value_uncertainty(old.value_uncertainty());
    new.set_policy_uncertainty(old.policy_uncertainty());
    if let Some(v) = old.secondary_value() {
        new.set_secondary_value(v);
    }
}

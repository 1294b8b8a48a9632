use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of B+-tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq, serde::Serialize)]
pub struct TreeStatsSnapshot {
    /// Number of leaf splits performed
    pub leaf_splits: u64,
    /// Number of inner node splits performed
    pub inner_splits: u64,
    /// Number of times a root split introduced a new root
    pub new_roots: u64,
    /// Number of times a single-child root was collapsed
    pub root_collapses: u64,
    /// Number of nodes re-packed at a different width
    pub repacks: u64,
    /// Number of nodes copied out of the immutable region
    pub cow_copies: u64,
    /// Number of empty leaves removed after erase
    pub leaf_removals: u64,
}

/// Thread-safe statistics tracking for B+-tree operations.
#[derive(Default, Debug)]
pub struct TreeStats {
    leaf_splits: AtomicU64,
    inner_splits: AtomicU64,
    new_roots: AtomicU64,
    root_collapses: AtomicU64,
    repacks: AtomicU64,
    cow_copies: AtomicU64,
    leaf_removals: AtomicU64,
}

impl TreeStats {
    /// Returns the current count of leaf splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of inner node splits.
    pub fn inner_splits(&self) -> u64 {
        self.inner_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of roots introduced by splits.
    pub fn new_roots(&self) -> u64 {
        self.new_roots.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of root collapses.
    pub fn root_collapses(&self) -> u64 {
        self.root_collapses.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of width re-packs.
    pub fn repacks(&self) -> u64 {
        self.repacks.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of copy-on-write copies.
    pub fn cow_copies(&self) -> u64 {
        self.cow_copies.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of empty leaves removed.
    pub fn leaf_removals(&self) -> u64 {
        self.leaf_removals.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_inner_splits(&self) {
        self.inner_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_new_roots(&self) {
        self.new_roots.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_collapses(&self) {
        self.root_collapses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_repacks(&self, n: u64) {
        if n > 0 {
            self.repacks.fetch_add(n, AtomicOrdering::Relaxed);
        }
    }

    pub(crate) fn add_cow_copies(&self, n: u64) {
        if n > 0 {
            self.cow_copies.fetch_add(n, AtomicOrdering::Relaxed);
        }
    }

    pub(crate) fn inc_leaf_removals(&self) {
        self.leaf_removals.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            leaf_splits: self.leaf_splits(),
            inner_splits: self.inner_splits(),
            new_roots: self.new_roots(),
            root_collapses: self.root_collapses(),
            repacks: self.repacks(),
            cow_copies: self.cow_copies(),
            leaf_removals: self.leaf_removals(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "colstore::bptree",
            leaf_splits = snapshot.leaf_splits,
            inner_splits = snapshot.inner_splits,
            new_roots = snapshot.new_roots,
            root_collapses = snapshot.root_collapses,
            repacks = snapshot.repacks,
            cow_copies = snapshot.cow_copies,
            leaf_removals = snapshot.leaf_removals,
            "tree stats snapshot"
        );
    }
}

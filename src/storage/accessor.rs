#![forbid(unsafe_code)]
//! Long-lived handles to tables, rows and link lists.
//!
//! A handle never points into a node. It holds a logical position (table
//! index, row index, column index) plus, for link lists, the last known root
//! ref of the list. Each handle's state lives behind an `Arc<Mutex<_>>`; the
//! owner keeps a [`Registry`] of weak references to every live handle so it
//! can adjust positions synchronously on each row mutation, mark handles
//! stale when nodes move, and detach them when their entity disappears.
//!
//! Lifecycle: `Attached` -> `Marked` (nodes moved, cached ref is stale) ->
//! `Attached` again on refresh, or `Detached` once the entity is gone.
//! `Detached` is terminal.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use crate::types::{LogicError, Ref, Result};

/// Lifecycle state of a handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
pub enum AccessorState {
    /// Cached position and refs match the tree.
    Attached,
    /// Position is valid but cached refs must be refreshed before use.
    Marked,
    /// The entity is gone; every use fails.
    Detached,
}

impl AccessorState {
    /// Moves `Attached` to `Marked`; other states are unchanged.
    pub fn mark(&mut self) {
        if *self == AccessorState::Attached {
            *self = AccessorState::Marked;
        }
    }

    /// Whether the handle still names an entity.
    pub fn is_attached(self) -> bool {
        self != AccessorState::Detached
    }
}

/// State shared by handles that follow a position in a sequence.
pub(crate) trait Positioned {
    fn state(&self) -> AccessorState;
    fn state_mut(&mut self) -> &mut AccessorState;
    fn position_mut(&mut self) -> &mut usize;
}

/// Weak references to every live handle of one kind.
#[derive(Debug)]
pub(crate) struct Registry<S> {
    entries: SmallVec<[Weak<Mutex<S>>; 4]>,
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self {
            entries: SmallVec::new(),
        }
    }
}

impl<S> Registry<S> {
    pub(crate) fn register(&mut self, state: S) -> Arc<Mutex<S>> {
        let shared = Arc::new(Mutex::new(state));
        self.entries.push(Arc::downgrade(&shared));
        shared
    }

    /// Strong references to every live handle; dropped handles are pruned.
    pub(crate) fn live(&mut self) -> Vec<Arc<Mutex<S>>> {
        self.entries.retain(|w| w.strong_count() > 0);
        self.entries.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn for_each(&mut self, mut f: impl FnMut(&mut S)) {
        for handle in self.live() {
            f(&mut handle.lock());
        }
    }

    /// Finds a live handle matching `pred`.
    pub(crate) fn find(&mut self, mut pred: impl FnMut(&S) -> bool) -> Option<Arc<Mutex<S>>> {
        self.live().into_iter().find(|h| pred(&h.lock()))
    }

    /// Whether `handle` was registered here.
    pub(crate) fn contains(&self, handle: &Arc<Mutex<S>>) -> bool {
        let target = Arc::as_ptr(handle);
        self.entries.iter().any(|w| std::ptr::eq(w.as_ptr(), target))
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<S: Positioned> Registry<S> {
    /// `n` entries were inserted at `ndx`.
    pub(crate) fn adj_accessors_insert_rows(&mut self, ndx: usize, n: usize) {
        self.for_each(|s| {
            if s.state().is_attached() && *s.position_mut() >= ndx {
                *s.position_mut() += n;
            }
        });
    }

    /// The entry at `ndx` was erased and later entries shifted down.
    pub(crate) fn adj_accessors_erase_row(&mut self, ndx: usize) {
        self.for_each(|s| {
            if !s.state().is_attached() {
                return;
            }
            let pos = *s.position_mut();
            if pos == ndx {
                *s.state_mut() = AccessorState::Detached;
            } else if pos > ndx {
                *s.position_mut() = pos - 1;
            }
        });
    }

    /// The entry at `source` replaced the one at `target`.
    pub(crate) fn adj_accessors_move(&mut self, target: usize, source: usize) {
        self.for_each(|s| {
            if !s.state().is_attached() {
                return;
            }
            let pos = *s.position_mut();
            if pos == target {
                *s.state_mut() = AccessorState::Detached;
            } else if pos == source {
                *s.position_mut() = target;
            }
        });
    }

    /// Marks every attached handle stale.
    pub(crate) fn mark_all(&mut self) {
        self.for_each(|s| s.state_mut().mark());
    }

    /// Detaches every handle and forgets them.
    pub(crate) fn detach_all(&mut self) {
        let mut detached = 0usize;
        self.for_each(|s| {
            if s.state().is_attached() {
                detached += 1;
            }
            *s.state_mut() = AccessorState::Detached;
        });
        if detached > 0 {
            trace!(target: "colstore::accessor", detached, "detached handles");
        }
        self.clear();
    }
}

#[derive(Debug)]
pub(crate) struct TableRefState {
    pub(crate) state: AccessorState,
    pub(crate) table: usize,
}

impl Positioned for TableRefState {
    fn state(&self) -> AccessorState {
        self.state
    }
    fn state_mut(&mut self) -> &mut AccessorState {
        &mut self.state
    }
    fn position_mut(&mut self) -> &mut usize {
        &mut self.table
    }
}

/// Handle to one table of a group.
///
/// Follows the table when tables before it are inserted or removed.
#[derive(Clone, Debug)]
pub struct TableRef {
    pub(crate) inner: Arc<Mutex<TableRefState>>,
}

impl TableRef {
    /// Current table index.
    pub fn index(&self) -> Result<usize> {
        let s = self.inner.lock();
        if !s.state.is_attached() {
            return Err(LogicError::DetachedAccessor.into());
        }
        Ok(s.table)
    }

    /// Lifecycle state.
    pub fn state(&self) -> AccessorState {
        self.inner.lock().state
    }

    /// Whether the handle still names a table.
    pub fn is_attached(&self) -> bool {
        self.state().is_attached()
    }

    /// Detaches the handle; calling it again is a no-op.
    pub fn detach(&self) {
        self.inner.lock().state = AccessorState::Detached;
    }
}

#[derive(Debug)]
pub(crate) struct RowState {
    pub(crate) state: AccessorState,
    pub(crate) row: usize,
}

impl Positioned for RowState {
    fn state(&self) -> AccessorState {
        self.state
    }
    fn state_mut(&mut self) -> &mut AccessorState {
        &mut self.state
    }
    fn position_mut(&mut self) -> &mut usize {
        &mut self.row
    }
}

/// Handle to one row of a table.
///
/// Follows the row through inserts, erasures and moves of other rows; it is
/// detached when its own row is erased or overwritten by a move.
#[derive(Clone, Debug)]
pub struct Row {
    pub(crate) inner: Arc<Mutex<RowState>>,
}

impl Row {
    /// Current row index.
    pub fn index(&self) -> Result<usize> {
        let s = self.inner.lock();
        if !s.state.is_attached() {
            return Err(LogicError::DetachedAccessor.into());
        }
        Ok(s.row)
    }

    /// Lifecycle state.
    pub fn state(&self) -> AccessorState {
        self.inner.lock().state
    }

    /// Whether the row still exists.
    pub fn is_attached(&self) -> bool {
        self.state().is_attached()
    }

    /// Detaches the handle; calling it again is a no-op.
    pub fn detach(&self) {
        self.inner.lock().state = AccessorState::Detached;
    }
}

#[derive(Debug)]
pub(crate) struct LinkListState {
    pub(crate) state: AccessorState,
    pub(crate) row: usize,
    pub(crate) col: usize,
    /// Root of the list tree as of the last refresh; null for an empty list.
    pub(crate) root: Ref,
}

impl Positioned for LinkListState {
    fn state(&self) -> AccessorState {
        self.state
    }
    fn state_mut(&mut self) -> &mut AccessorState {
        &mut self.state
    }
    fn position_mut(&mut self) -> &mut usize {
        &mut self.row
    }
}

impl Registry<LinkListState> {
    /// A column was inserted at `col`.
    pub(crate) fn adj_accessors_insert_column(&mut self, col: usize) {
        self.for_each(|s| {
            if s.state.is_attached() && s.col >= col {
                s.col += 1;
                s.state.mark();
            }
        });
    }

    /// The column at `col` was removed.
    pub(crate) fn adj_accessors_erase_column(&mut self, col: usize) {
        self.for_each(|s| {
            if !s.state.is_attached() {
                return;
            }
            if s.col == col {
                s.state = AccessorState::Detached;
            } else if s.col > col {
                s.col -= 1;
                s.state.mark();
            }
        });
    }

    /// Marks the lists of one row stale after their cells changed.
    pub(crate) fn mark_row(&mut self, row: usize) {
        self.for_each(|s| {
            if s.row == row {
                s.state.mark();
            }
        });
    }
}

/// Handle to the link list stored in one cell of a link-list column.
#[derive(Clone, Debug)]
pub struct LinkList {
    pub(crate) inner: Arc<Mutex<LinkListState>>,
}

impl LinkList {
    /// Current (row, column) of the owning cell.
    pub fn position(&self) -> Result<(usize, usize)> {
        let s = self.inner.lock();
        if !s.state.is_attached() {
            return Err(LogicError::DetachedAccessor.into());
        }
        Ok((s.row, s.col))
    }

    /// Lifecycle state.
    pub fn state(&self) -> AccessorState {
        self.inner.lock().state
    }

    /// Whether the cached list root must be refreshed before use.
    pub fn is_marked(&self) -> bool {
        self.state() == AccessorState::Marked
    }

    /// Whether the owning row still exists.
    pub fn is_attached(&self) -> bool {
        self.state().is_attached()
    }

    /// Detaches the handle; calling it again is a no-op.
    pub fn detach(&self) {
        self.inner.lock().state = AccessorState::Detached;
    }
}

#![forbid(unsafe_code)]
//! Column: a logical integer sequence stored as one B+-tree.
//!
//! A column caches its root accessor, an optional [`SearchIndex`] and the
//! most recently resolved leaf so repeated reads in the same region skip the
//! descent. The cache is dropped on every mutation and refresh.
//!
//! Refs held by a column are only meaningful for the store the column was
//! attached to. After the owning table moves (copy-on-write, commit), the
//! column is marked and must be refreshed from its parent node before use.

mod index;
mod kind;

use std::cell::Cell;

use tracing::trace;

use crate::primitives::alloc::{SlabAlloc, Translate};
use crate::storage::accessor::AccessorState;
use crate::storage::array::{Array, Condition, Equal, NodeKind};
use crate::storage::bptree::{build_tree, BpTree, LeafSpan, TreeConfig, TreeShape};
use crate::storage::writer::{write_deep, ArrayWriter};
use crate::types::{Ref, Result, StoreError};

pub use index::SearchIndex;
pub use kind::{ColumnFlags, ColumnKind};

/// Accessor for one column.
#[derive(Debug)]
pub struct Column {
    tree: BpTree,
    kind: ColumnKind,
    index: Option<SearchIndex>,
    leaf_cache: Cell<Option<LeafSpan>>,
    ndx_in_parent: usize,
    state: AccessorState,
}

impl Column {
    /// Allocates an empty column holding `rows` default values.
    pub fn create(alloc: &mut SlabAlloc, cfg: &TreeConfig, kind: ColumnKind, rows: usize) -> Result<Column> {
        let tree = if rows == 0 {
            BpTree::create(alloc, kind.has_refs())?
        } else {
            let values = vec![kind.default_value(); rows];
            BpTree::from_values(alloc, cfg, kind.has_refs(), &values)?
        };
        Ok(Self::from_parts(tree, kind, None))
    }

    /// Attaches to a persisted column.
    pub fn attach<T: Translate + ?Sized>(store: &T, kind: ColumnKind, root: Ref, index: Option<Ref>) -> Column {
        let tree = BpTree::attach(store, root);
        let index = index.map(|r| SearchIndex::attach(store, r));
        Self::from_parts(tree, kind, index)
    }

    fn from_parts(tree: BpTree, kind: ColumnKind, index: Option<SearchIndex>) -> Column {
        Column {
            tree,
            kind,
            index,
            leaf_cache: Cell::new(None),
            ndx_in_parent: 0,
            state: AccessorState::Attached,
        }
    }

    /// Column kind.
    pub fn kind(&self) -> ColumnKind {
        self.kind
    }

    /// Updates the link target after tables were inserted or removed.
    pub(crate) fn set_kind(&mut self, kind: ColumnKind) {
        debug_assert_eq!(std::mem::discriminant(&kind), std::mem::discriminant(&self.kind));
        self.kind = kind;
    }

    /// Root ref.
    pub fn root_ref(&self) -> Ref {
        self.tree.root_ref()
    }

    /// Search index root ref.
    pub fn index_ref(&self) -> Option<Ref> {
        self.index.as_ref().map(SearchIndex::root_ref)
    }

    /// The underlying tree.
    pub fn tree(&self) -> &BpTree {
        &self.tree
    }

    /// The search index, when present.
    pub fn search_index(&self) -> Option<&SearchIndex> {
        self.index.as_ref()
    }

    /// Whether a search index is attached.
    pub fn has_search_index(&self) -> bool {
        self.index.is_some()
    }

    /// Persisted flags.
    pub fn flags(&self) -> ColumnFlags {
        ColumnFlags {
            indexed: self.index.is_some(),
            unique: self.index.as_ref().is_some_and(SearchIndex::is_unique),
        }
    }

    /// Slot of the root ref in the parent's column list.
    pub fn ndx_in_parent(&self) -> usize {
        self.ndx_in_parent
    }

    pub(crate) fn set_ndx_in_parent(&mut self, ndx: usize) {
        self.ndx_in_parent = ndx;
    }

    /// Number of parent slots the column occupies.
    pub fn slot_count(&self) -> usize {
        1 + usize::from(self.index.is_some())
    }

    /// Lifecycle state of the cached refs.
    pub fn state(&self) -> AccessorState {
        self.state
    }

    /// Marks cached refs stale.
    pub fn mark(&mut self) {
        self.state.mark();
        self.leaf_cache.set(None);
    }

    /// Whether cached refs are stale.
    pub fn is_marked(&self) -> bool {
        self.state == AccessorState::Marked
    }

    /// Re-reads root and index refs from the parent's column list.
    ///
    /// `parent` must itself be current; refresh always runs top-down.
    pub fn refresh_accessor_tree<T: Translate + ?Sized>(&mut self, store: &T, parent: &Array) -> Result<()> {
        let root = parent
            .get_ref(store, self.ndx_in_parent)
            .ok_or(StoreError::Corruption("column slot holds no ref"))?;
        self.tree = BpTree::attach(store, root);
        if self.index.is_some() {
            let r = parent
                .get_ref(store, self.ndx_in_parent + 1)
                .ok_or(StoreError::Corruption("index slot holds no ref"))?;
            self.index = Some(SearchIndex::attach(store, r));
        }
        self.leaf_cache.set(None);
        self.state = AccessorState::Attached;
        Ok(())
    }

    /// Detaches the column; it must not be used again.
    pub fn detach(&mut self) {
        self.state = AccessorState::Detached;
        self.leaf_cache.set(None);
    }

    /// Element count.
    pub fn size<T: Translate + ?Sized>(&self, store: &T) -> usize {
        self.tree.size(store)
    }

    /// Value at `ndx`.
    pub fn get<T: Translate + ?Sized>(&self, store: &T, ndx: usize) -> i64 {
        debug_assert!(self.state == AccessorState::Attached, "column used while {:?}", self.state);
        if self.tree.root_is_leaf() {
            return self.tree.root().get(store, ndx);
        }
        let span = match self.leaf_cache.get() {
            Some(span) if span.contains(ndx) => span,
            _ => {
                let span = self.tree.get_bptree_leaf(store, ndx);
                self.leaf_cache.set(Some(span));
                span
            }
        };
        span.leaf.get(store, ndx - span.begin)
    }

    /// Every value, in order.
    pub fn to_vec<T: Translate + ?Sized>(&self, store: &T) -> Vec<i64> {
        self.tree.to_vec(store)
    }

    /// Visits leaves in order from the one holding `from`.
    pub fn for_each_leaf<T, F>(&self, store: &T, from: usize, f: F) -> bool
    where
        T: Translate + ?Sized,
        F: FnMut(LeafSpan) -> bool,
    {
        self.tree.for_each_leaf(store, from, f)
    }

    /// Depth and node counts.
    pub fn shape<T: Translate + ?Sized>(&self, store: &T) -> TreeShape {
        self.tree.shape(store)
    }

    /// First row in `begin..end` satisfying `C` against `value`.
    pub fn find_first_with<C: Condition, T: Translate + ?Sized>(
        &self,
        store: &T,
        value: i64,
        begin: usize,
        end: usize,
    ) -> Option<usize> {
        self.tree.find_first::<C, T>(store, value, begin, end.min(self.size(store)))
    }

    /// First row equal to `value`; uses the search index when present.
    pub fn find_first<T: Translate + ?Sized>(&self, store: &T, value: i64) -> Option<usize> {
        match &self.index {
            Some(index) => index.find_first(store, value),
            None => self.find_first_with::<Equal, T>(store, value, 0, usize::MAX),
        }
    }

    /// Every row equal to `value`, ascending.
    pub fn find_all<T: Translate + ?Sized>(&self, store: &T, value: i64) -> Vec<usize> {
        match &self.index {
            Some(index) => index.find_all(store, value),
            None => {
                let mut out = Vec::new();
                self.tree
                    .find_all::<Equal, T>(store, value, 0, self.size(store), &mut out);
                out
            }
        }
    }

    /// Number of rows equal to `value`.
    pub fn count<T: Translate + ?Sized>(&self, store: &T, value: i64) -> usize {
        match &self.index {
            Some(index) => index.count(store, value),
            None => self.find_all(store, value).len(),
        }
    }

    /// First row not less than `value`; the column must be sorted.
    pub fn lower_bound<T: Translate + ?Sized>(&self, store: &T, value: i64) -> usize {
        self.tree.lower_bound(store, value)
    }

    /// First row greater than `value`; the column must be sorted.
    pub fn upper_bound<T: Translate + ?Sized>(&self, store: &T, value: i64) -> usize {
        self.tree.upper_bound(store, value)
    }

    /// Overwrites the value at `ndx`; returns the previous value.
    ///
    /// For link-list columns the caller owns the subtree the old value named.
    pub fn set(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, ndx: usize, value: i64) -> Result<i64> {
        let old = self.get(alloc, ndx);
        if old == value {
            return Ok(old);
        }
        if let Some(index) = &self.index {
            index.check_insert(alloc, value)?;
        }
        self.leaf_cache.set(None);
        self.tree.set(alloc, cfg, ndx, value)?;
        if let Some(index) = &mut self.index {
            index.set(alloc, cfg, ndx, old, value)?;
        }
        Ok(old)
    }

    /// Inserts `value` before `ndx`.
    pub fn insert(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, ndx: usize, value: i64) -> Result<()> {
        if let Some(index) = &self.index {
            index.check_insert(alloc, value)?;
        }
        self.leaf_cache.set(None);
        self.tree.insert(alloc, cfg, ndx, value)?;
        if let Some(index) = &mut self.index {
            index.insert_row(alloc, cfg, ndx, value)?;
        }
        Ok(())
    }

    /// Appends `value`.
    pub fn add(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, value: i64) -> Result<()> {
        let size = self.size(alloc);
        self.insert(alloc, cfg, size, value)
    }

    /// Removes the value at `ndx`; `is_last` must say whether `ndx` is the last row.
    ///
    /// Link lists owned by the removed cell are destroyed.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, ndx: usize, is_last: bool) -> Result<()> {
        debug_assert_eq!(is_last, ndx + 1 == self.size(alloc));
        self.leaf_cache.set(None);
        let removed = self.tree.erase(alloc, cfg, ndx)?;
        if let Some(index) = &mut self.index {
            index.erase_row(alloc, cfg, ndx, removed)?;
        }
        self.release_cell(alloc, removed);
        Ok(())
    }

    /// Moves the last value into `ndx` and drops the last row.
    pub fn move_last_over(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, ndx: usize) -> Result<()> {
        let last = self.size(alloc) - 1;
        let moved = self.get(alloc, last);
        self.leaf_cache.set(None);
        let removed = self.tree.move_last_over(alloc, cfg, ndx)?;
        if let Some(index) = &mut self.index {
            index.move_last_over(alloc, cfg, ndx, removed, last, moved)?;
        }
        self.release_cell(alloc, removed);
        Ok(())
    }

    /// Removes every value.
    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.leaf_cache.set(None);
        self.tree.clear(alloc)?;
        if let Some(index) = &mut self.index {
            index.clear(alloc)?;
        }
        Ok(())
    }

    /// Adds `delta` to every value `>= limit`.
    pub fn adjust_ge(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, limit: i64, delta: i64) -> Result<()> {
        self.leaf_cache.set(None);
        self.tree.adjust_ge(alloc, cfg, limit, delta)?;
        if self.index.is_some() {
            self.rebuild_search_index(alloc, cfg)?;
        }
        Ok(())
    }

    /// Attaches a new search index built from the current values.
    pub fn create_search_index(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, unique: bool) -> Result<()> {
        if !self.kind.supports_search_index() {
            return Err(crate::types::LogicError::ColumnKindMismatch.into());
        }
        if self.index.is_some() {
            return Ok(());
        }
        let values = self.to_vec(alloc);
        self.index = Some(SearchIndex::build(alloc, cfg, &values, unique)?);
        trace!(target: "colstore::column", root = self.root_ref().0, unique, "created search index");
        Ok(())
    }

    /// Detaches and destroys the search index.
    pub fn remove_search_index(&mut self, alloc: &mut SlabAlloc) {
        if let Some(index) = self.index.take() {
            index.destroy(alloc);
        }
    }

    fn rebuild_search_index(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig) -> Result<()> {
        if let Some(old) = self.index.take() {
            let unique = old.is_unique();
            old.destroy(alloc);
            let values = self.to_vec(alloc);
            self.index = Some(SearchIndex::build(alloc, cfg, &values, unique)?);
        }
        Ok(())
    }

    /// Releases every node of the column and its index.
    pub fn destroy(self, alloc: &mut SlabAlloc) {
        if let Some(index) = self.index {
            index.destroy(alloc);
        }
        self.tree.destroy(alloc);
    }

    /// Serializes rows `offset..offset + size` as a standalone tree and returns its root.
    ///
    /// Link lists referenced by the slice are copied along.
    pub fn write<T: Translate + ?Sized>(
        &self,
        store: &T,
        offset: usize,
        size: usize,
        max_node_size: usize,
        out: &mut dyn ArrayWriter,
    ) -> Result<Ref> {
        let total = self.size(store);
        let end = offset.saturating_add(size).min(total);
        let begin = offset.min(end);
        let mut values = Vec::with_capacity(end - begin);
        self.for_each_leaf(store, begin, |span| {
            if span.begin >= end {
                return false;
            }
            let from = begin.saturating_sub(span.begin);
            let to = (end - span.begin).min(span.leaf.size());
            values.extend((from..to).map(|i| span.leaf.get(store, i)));
            true
        });
        if self.kind.has_refs() {
            for v in values.iter_mut() {
                if let Some(r) = Ref::from_element(*v) {
                    *v = write_deep(store, r, false, out)?.to_element();
                }
            }
        }
        build_tree(&values, self.kind.has_refs(), max_node_size, |kind, elements| {
            out.write_array(&crate::storage::array::encode_node(kind, false, elements))
        })
    }

    fn release_cell(&self, alloc: &mut SlabAlloc, removed: i64) {
        if self.kind.has_refs() {
            if let Some(r) = Ref::from_element(removed) {
                Array::destroy_deep_ref(alloc, r);
            }
        }
    }
}

/// Leaf kind used by columns of `kind`.
pub fn leaf_node_kind(kind: ColumnKind) -> NodeKind {
    if kind.has_refs() {
        NodeKind::HasRefs
    } else {
        NodeKind::Normal
    }
}

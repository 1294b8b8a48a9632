#![forbid(unsafe_code)]
//! Table accessor: equally long columns plus the handles that follow its rows.
//!
//! Persisted as a has-refs top node `[spec, columns, row_count]`. `spec` holds
//! one encoded [`ColumnKind`] per column; `columns` holds per column its root
//! ref followed by the search index ref when the column is indexed.
//!
//! Every mutation rewrites the slots whose refs moved, bottom-up, so after
//! each call the table's top ref is the only thing the owner has to store.

use std::sync::Arc;

use tracing::trace;

use crate::primitives::alloc::{SlabAlloc, Translate};
use crate::storage::accessor::{AccessorState, LinkList, LinkListState, Registry, Row, RowState};
use crate::storage::array::{Array, Equal, NodeKind};
use crate::storage::bptree::{BpTree, TreeConfig, TreeShape};
use crate::storage::column::{Column, ColumnFlags, ColumnKind};
use crate::types::{from_tagged, to_tagged, LogicError, Ref, Result, StoreError};

pub(crate) const TOP_SPEC: usize = 0;
pub(crate) const TOP_COLUMNS: usize = 1;
pub(crate) const TOP_ROWS: usize = 2;

/// A row mutation in a link target table, replayed on every linking column.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RowChange {
    Inserted { row: usize, n: usize },
    Erased { row: usize },
    Moved { row: usize, last: usize },
    Cleared,
}

#[derive(Debug)]
pub(crate) struct Table {
    top: Array,
    spec: Array,
    slots: Array,
    columns: Vec<Column>,
    row_count: usize,
    state: AccessorState,
    rows: Registry<RowState>,
    link_lists: Registry<LinkListState>,
}

impl Table {
    pub(crate) fn create(alloc: &mut SlabAlloc) -> Result<Table> {
        let spec = Array::create_empty(alloc, NodeKind::Normal)?;
        let slots = Array::create_empty(alloc, NodeKind::HasRefs)?;
        let top = Array::from_values(
            alloc,
            NodeKind::HasRefs,
            false,
            &[spec.node_ref().to_element(), slots.node_ref().to_element(), to_tagged(0)],
        )?;
        Ok(Table {
            top,
            spec,
            slots,
            columns: Vec::new(),
            row_count: 0,
            state: AccessorState::Attached,
            rows: Registry::default(),
            link_lists: Registry::default(),
        })
    }

    /// Attaches to a persisted table, validating the top-level layout.
    pub(crate) fn attach<T: Translate + ?Sized>(store: &T, r: Ref, limit: u64) -> Result<Table> {
        let top = Array::try_attach(store, r, limit)?;
        if !top.has_refs() || top.size() != 3 {
            return Err(StoreError::InvalidDatabase("table top has wrong shape"));
        }
        let child = |slot| {
            top.get_ref(store, slot)
                .ok_or(StoreError::InvalidDatabase("table top slot holds no ref"))
                .and_then(|r| Array::try_attach(store, r, limit))
        };
        let spec = child(TOP_SPEC)?;
        let slots = child(TOP_COLUMNS)?;
        let mut columns = Vec::with_capacity(spec.size());
        let mut slot = 0;
        for c in 0..spec.size() {
            let (kind, flags) = ColumnKind::from_spec(spec.get(store, c))?;
            if slot + 1 + usize::from(flags.indexed) > slots.size() {
                return Err(StoreError::InvalidDatabase("column list shorter than spec"));
            }
            let root = slots
                .get_ref(store, slot)
                .ok_or(StoreError::InvalidDatabase("column slot holds no ref"))?;
            let index = match flags.indexed {
                true => Some(
                    slots
                        .get_ref(store, slot + 1)
                        .ok_or(StoreError::InvalidDatabase("index slot holds no ref"))?,
                ),
                false => None,
            };
            let mut column = Column::attach(store, kind, root, index);
            column.set_ndx_in_parent(slot);
            slot += column.slot_count();
            columns.push(column);
        }
        let row_count = from_tagged(top.get(store, TOP_ROWS)) as usize;
        Ok(Table {
            top,
            spec,
            slots,
            columns,
            row_count,
            state: AccessorState::Attached,
            rows: Registry::default(),
            link_lists: Registry::default(),
        })
    }

    pub(crate) fn top_ref(&self) -> Ref {
        self.top.node_ref()
    }

    pub(crate) fn row_count(&self) -> usize {
        self.row_count
    }

    pub(crate) fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub(crate) fn column(&self, col: usize) -> Result<&Column> {
        self.columns.get(col).ok_or(LogicError::ColumnOutOfBounds.into())
    }

    pub(crate) fn column_kind(&self, col: usize) -> Result<ColumnKind> {
        Ok(self.column(col)?.kind())
    }

    pub(crate) fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Whether any column links into table `target`.
    pub(crate) fn links_to(&self, target: usize) -> bool {
        self.columns.iter().any(|c| c.kind().link_target() == Some(target))
    }

    pub(crate) fn state(&self) -> AccessorState {
        self.state
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.state == AccessorState::Marked
    }

    /// Marks the table, its columns and its link lists stale.
    pub(crate) fn mark(&mut self) {
        self.state.mark();
        for column in &mut self.columns {
            column.mark();
        }
        self.link_lists.mark_all();
    }

    /// Re-attaches to `r` top-down: table nodes first, then every column.
    pub(crate) fn refresh<T: Translate + ?Sized>(&mut self, store: &T, r: Ref) -> Result<()> {
        if self.state == AccessorState::Detached {
            return Err(LogicError::DetachedAccessor.into());
        }
        self.top.refresh(store, r);
        let spec = self.top.get_ref(store, TOP_SPEC);
        let slots = self.top.get_ref(store, TOP_COLUMNS);
        let (Some(spec), Some(slots)) = (spec, slots) else {
            return Err(StoreError::Corruption("table top lost its children"));
        };
        self.spec.refresh(store, spec);
        self.slots.refresh(store, slots);
        for column in &mut self.columns {
            column.refresh_accessor_tree(store, &self.slots)?;
        }
        self.row_count = from_tagged(self.top.get(store, TOP_ROWS)) as usize;
        self.state = AccessorState::Attached;
        trace!(target: "colstore::accessor", top = r.0, columns = self.columns.len(), "refreshed table");
        Ok(())
    }

    /// Detaches every handle of the table; the table must not be used again.
    pub(crate) fn detach_accessors(&mut self) {
        self.rows.detach_all();
        self.link_lists.detach_all();
        for column in &mut self.columns {
            column.detach();
        }
        self.state = AccessorState::Detached;
    }

    /// Whether `list` was handed out by this table.
    pub(crate) fn owns_list(&self, list: &LinkList) -> bool {
        self.link_lists.contains(&list.inner)
    }

    pub(crate) fn owns_row(&self, row: &Row) -> bool {
        self.rows.contains(&row.inner)
    }

    fn check_row(&self, row: usize) -> Result<()> {
        if row >= self.row_count {
            return Err(LogicError::IndexOutOfBounds {
                index: row,
                size: self.row_count,
            }
            .into());
        }
        Ok(())
    }

    fn renumber_slots(&mut self) {
        let mut slot = 0;
        for column in &mut self.columns {
            column.set_ndx_in_parent(slot);
            slot += column.slot_count();
        }
    }

    fn slot_of(&self, col: usize) -> usize {
        self.columns[..col].iter().map(Column::slot_count).sum()
    }

    fn sync_column(&mut self, alloc: &mut SlabAlloc, col: usize) -> Result<()> {
        let column = &self.columns[col];
        let slot = column.ndx_in_parent();
        let root = column.root_ref();
        let index = column.index_ref();
        self.slots.set(alloc, slot, root.to_element())?;
        if let Some(index) = index {
            self.slots.set(alloc, slot + 1, index.to_element())?;
        }
        self.sync_top(alloc)
    }

    fn sync_top(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.top.set(alloc, TOP_SPEC, self.spec.node_ref().to_element())?;
        self.top.set(alloc, TOP_COLUMNS, self.slots.node_ref().to_element())?;
        self.top.set(alloc, TOP_ROWS, to_tagged(self.row_count as u64))
    }

    pub(crate) fn insert_column(
        &mut self,
        alloc: &mut SlabAlloc,
        cfg: &TreeConfig,
        col: usize,
        kind: ColumnKind,
    ) -> Result<()> {
        if col > self.columns.len() {
            return Err(LogicError::ColumnOutOfBounds.into());
        }
        let column = Column::create(alloc, cfg, kind, self.row_count)?;
        let slot = self.slot_of(col);
        self.slots.insert(alloc, slot, column.root_ref().to_element())?;
        self.spec.insert(alloc, col, kind.to_spec(ColumnFlags::default()))?;
        self.columns.insert(col, column);
        self.renumber_slots();
        self.link_lists.adj_accessors_insert_column(col);
        self.sync_top(alloc)
    }

    pub(crate) fn remove_column(&mut self, alloc: &mut SlabAlloc, col: usize) -> Result<()> {
        if col >= self.columns.len() {
            return Err(LogicError::ColumnOutOfBounds.into());
        }
        let column = self.columns.remove(col);
        let slot = column.ndx_in_parent();
        self.slots.erase_range(alloc, slot, slot + column.slot_count())?;
        self.spec.erase(alloc, col)?;
        column.destroy(alloc);
        self.renumber_slots();
        self.link_lists.adj_accessors_erase_column(col);
        if self.columns.is_empty() && self.row_count > 0 {
            // Rows only exist through columns.
            self.row_count = 0;
            self.rows.detach_all();
        }
        self.sync_top(alloc)
    }

    /// Points link columns at new table indices after tables moved.
    pub(crate) fn retarget(&mut self, alloc: &mut SlabAlloc, map: impl Fn(usize) -> usize) -> Result<()> {
        for c in 0..self.columns.len() {
            let kind = self.columns[c].kind();
            let Some(target) = kind.link_target() else {
                continue;
            };
            let moved = map(target);
            if moved != target {
                let kind = kind.with_target(moved);
                self.columns[c].set_kind(kind);
                self.spec.set(alloc, c, kind.to_spec(self.columns[c].flags()))?;
            }
        }
        self.sync_top(alloc)
    }

    pub(crate) fn add_search_index(
        &mut self,
        alloc: &mut SlabAlloc,
        cfg: &TreeConfig,
        col: usize,
        unique: bool,
    ) -> Result<()> {
        let kind = self.column_kind(col)?;
        if !kind.supports_search_index() {
            return Err(LogicError::ColumnKindMismatch.into());
        }
        if self.columns[col].has_search_index() {
            return Ok(());
        }
        self.columns[col].create_search_index(alloc, cfg, unique)?;
        let column = &self.columns[col];
        let (slot, flags) = (column.ndx_in_parent(), column.flags());
        let index = column.index_ref().ok_or(StoreError::Corruption("index vanished"))?;
        self.slots.insert(alloc, slot + 1, index.to_element())?;
        self.spec.set(alloc, col, kind.to_spec(flags))?;
        self.renumber_slots();
        self.sync_top(alloc)
    }

    pub(crate) fn remove_search_index(&mut self, alloc: &mut SlabAlloc, col: usize) -> Result<()> {
        let kind = self.column_kind(col)?;
        if !self.columns[col].has_search_index() {
            return Err(LogicError::NoSearchIndex.into());
        }
        let slot = self.columns[col].ndx_in_parent();
        self.slots.erase(alloc, slot + 1)?;
        self.columns[col].remove_search_index(alloc);
        self.spec.set(alloc, col, kind.to_spec(ColumnFlags::default()))?;
        self.renumber_slots();
        self.sync_top(alloc)
    }

    pub(crate) fn insert_rows(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, row: usize, n: usize) -> Result<()> {
        if row > self.row_count {
            return Err(LogicError::IndexOutOfBounds {
                index: row,
                size: self.row_count,
            }
            .into());
        }
        if n == 0 {
            return Ok(());
        }
        for column in &self.columns {
            if let Some(index) = column.search_index().filter(|i| i.is_unique()) {
                let default = column.kind().default_value();
                if n > 1 {
                    return Err(StoreError::DuplicateValue(default));
                }
                index.check_insert(alloc, default)?;
            }
        }
        for c in 0..self.columns.len() {
            let default = self.columns[c].kind().default_value();
            for i in 0..n {
                self.columns[c].insert(alloc, cfg, row + i, default)?;
            }
            self.sync_column(alloc, c)?;
        }
        self.row_count += n;
        self.rows.adj_accessors_insert_rows(row, n);
        self.link_lists.adj_accessors_insert_rows(row, n);
        self.sync_top(alloc)
    }

    pub(crate) fn erase_row(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, row: usize) -> Result<()> {
        self.check_row(row)?;
        let is_last = row + 1 == self.row_count;
        for c in 0..self.columns.len() {
            self.columns[c].erase(alloc, cfg, row, is_last)?;
            self.sync_column(alloc, c)?;
        }
        self.row_count -= 1;
        self.rows.adj_accessors_erase_row(row);
        self.link_lists.adj_accessors_erase_row(row);
        self.sync_top(alloc)
    }

    pub(crate) fn move_last_over(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, row: usize) -> Result<()> {
        self.check_row(row)?;
        let last = self.row_count - 1;
        for c in 0..self.columns.len() {
            self.columns[c].move_last_over(alloc, cfg, row)?;
            self.sync_column(alloc, c)?;
        }
        self.row_count -= 1;
        self.rows.adj_accessors_move(row, last);
        self.link_lists.adj_accessors_move(row, last);
        self.sync_top(alloc)
    }

    pub(crate) fn clear(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        for c in 0..self.columns.len() {
            self.columns[c].clear(alloc)?;
            self.sync_column(alloc, c)?;
        }
        self.row_count = 0;
        self.rows.detach_all();
        self.link_lists.detach_all();
        self.sync_top(alloc)
    }

    pub(crate) fn get<T: Translate + ?Sized>(&self, store: &T, col: usize, row: usize) -> Result<i64> {
        let column = self.column(col)?;
        self.check_row(row)?;
        Ok(column.get(store, row))
    }

    pub(crate) fn set(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, col: usize, row: usize, value: i64) -> Result<()> {
        if self.column_kind(col)?.has_refs() {
            return Err(LogicError::ColumnKindMismatch.into());
        }
        self.check_row(row)?;
        self.columns[col].set(alloc, cfg, row, value)?;
        self.sync_column(alloc, col)
    }

    /// Target rows listed in one link-list cell.
    pub(crate) fn list_values<T: Translate + ?Sized>(&self, store: &T, col: usize, row: usize) -> Result<Vec<usize>> {
        let cell = self.get(store, col, row)?;
        if !self.columns[col].kind().has_refs() {
            return Err(LogicError::ColumnKindMismatch.into());
        }
        Ok(match Ref::from_element(cell) {
            Some(root) => BpTree::attach(store, root)
                .to_vec(store)
                .into_iter()
                .map(|v| v as usize)
                .collect(),
            None => Vec::new(),
        })
    }

    /// Replays a row change of table `target` on every column linking to it.
    pub(crate) fn apply_link_change(
        &mut self,
        alloc: &mut SlabAlloc,
        cfg: &TreeConfig,
        target: usize,
        change: RowChange,
    ) -> Result<()> {
        for c in 0..self.columns.len() {
            match self.columns[c].kind() {
                ColumnKind::Link { target: t } if t == target => self.fix_links(alloc, cfg, c, change)?,
                ColumnKind::LinkList { target: t } if t == target => self.fix_lists(alloc, cfg, c, change)?,
                _ => continue,
            }
            self.sync_column(alloc, c)?;
        }
        Ok(())
    }

    fn fix_links(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, c: usize, change: RowChange) -> Result<()> {
        let column = &mut self.columns[c];
        match change {
            RowChange::Inserted { row, n } => column.adjust_ge(alloc, cfg, row as i64 + 1, n as i64)?,
            RowChange::Erased { row } => {
                for hit in column.find_all(alloc, row as i64 + 1) {
                    column.set(alloc, cfg, hit, 0)?;
                }
                column.adjust_ge(alloc, cfg, row as i64 + 2, -1)?;
            }
            RowChange::Moved { row, last } => {
                let nulled = column.find_all(alloc, row as i64 + 1);
                let moved = if row == last {
                    Vec::new()
                } else {
                    column.find_all(alloc, last as i64 + 1)
                };
                for hit in nulled {
                    column.set(alloc, cfg, hit, 0)?;
                }
                for hit in moved {
                    column.set(alloc, cfg, hit, row as i64 + 1)?;
                }
            }
            RowChange::Cleared => {
                for (row, value) in column.to_vec(alloc).into_iter().enumerate() {
                    if value != 0 {
                        column.set(alloc, cfg, row, 0)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn fix_lists(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, c: usize, change: RowChange) -> Result<()> {
        let cells = self.columns[c].to_vec(alloc);
        for (row, cell) in cells.into_iter().enumerate() {
            let Some(root) = Ref::from_element(cell) else {
                continue;
            };
            let mut list = BpTree::attach(alloc, root);
            match change {
                RowChange::Inserted { row: at, n } => list.adjust_ge(alloc, cfg, at as i64, n as i64)?,
                RowChange::Erased { row: gone } => {
                    remove_all(alloc, cfg, &mut list, gone as i64)?;
                    list.adjust_ge(alloc, cfg, gone as i64 + 1, -1)?;
                }
                RowChange::Moved { row: gone, last } => {
                    remove_all(alloc, cfg, &mut list, gone as i64)?;
                    if gone != last {
                        let mut hits = Vec::new();
                        list.find_all::<Equal, _>(alloc, last as i64, 0, list.size(alloc), &mut hits);
                        for hit in hits {
                            list.set(alloc, cfg, hit, gone as i64)?;
                        }
                    }
                }
                RowChange::Cleared => {
                    let size = list.size(alloc);
                    for i in (0..size).rev() {
                        list.erase(alloc, cfg, i)?;
                    }
                }
            }
            let new_root = if list.is_empty(alloc) {
                list.destroy(alloc);
                Ref::NULL
            } else {
                list.root_ref()
            };
            if new_root != root {
                self.columns[c].set(alloc, cfg, row, new_root.to_element())?;
            }
            self.link_lists.mark_row(row);
        }
        Ok(())
    }

    /// Returns the handle for the list at (`row`, `col`), registering one if needed.
    pub(crate) fn link_list<T: Translate + ?Sized>(&mut self, store: &T, row: usize, col: usize) -> Result<LinkList> {
        let cell = self.get(store, col, row)?;
        if !self.columns[col].kind().has_refs() {
            return Err(LogicError::ColumnKindMismatch.into());
        }
        let existing = self
            .link_lists
            .find(|s| s.state.is_attached() && s.row == row && s.col == col);
        if let Some(inner) = existing {
            return Ok(LinkList { inner });
        }
        let inner = self.link_lists.register(LinkListState {
            state: AccessorState::Attached,
            row,
            col,
            root: Ref::from_element(cell).unwrap_or(Ref::NULL),
        });
        Ok(LinkList { inner })
    }

    pub(crate) fn row(&mut self, row: usize) -> Result<Row> {
        self.check_row(row)?;
        let existing = self.rows.find(|s| s.state.is_attached() && s.row == row);
        let inner = match existing {
            Some(inner) => inner,
            None => self.rows.register(RowState {
                state: AccessorState::Attached,
                row,
            }),
        };
        Ok(Row { inner })
    }

    /// Target table of a list handle owned by this table.
    pub(crate) fn list_target(&self, list: &LinkList) -> Result<usize> {
        if !self.link_lists.contains(&list.inner) {
            return Err(LogicError::DetachedAccessor.into());
        }
        let s = list.inner.lock();
        if !s.state.is_attached() {
            return Err(LogicError::DetachedAccessor.into());
        }
        self.column_kind(s.col)?
            .link_target()
            .ok_or(LogicError::ColumnKindMismatch.into())
    }

    /// Current root of a list, re-reading the owning cell when the handle is marked.
    fn list_root<T: Translate + ?Sized>(&self, store: &T, s: &mut LinkListState) -> Result<Ref> {
        if s.col >= self.columns.len() || !self.columns[s.col].kind().has_refs() {
            return Err(LogicError::ColumnKindMismatch.into());
        }
        match s.state {
            AccessorState::Detached => Err(LogicError::DetachedAccessor.into()),
            AccessorState::Attached => Ok(s.root),
            AccessorState::Marked => {
                let cell = self.get(store, s.col, s.row)?;
                s.root = Ref::from_element(cell).unwrap_or(Ref::NULL);
                s.state = AccessorState::Attached;
                Ok(s.root)
            }
        }
    }

    pub(crate) fn list_len<T: Translate + ?Sized>(&self, store: &T, list: &LinkList) -> Result<usize> {
        let mut s = list.inner.lock();
        let root = self.list_root(store, &mut s)?;
        Ok(if root.is_null() {
            0
        } else {
            BpTree::attach(store, root).size(store)
        })
    }

    pub(crate) fn list_get<T: Translate + ?Sized>(&self, store: &T, list: &LinkList, i: usize) -> Result<usize> {
        let mut s = list.inner.lock();
        let root = self.list_root(store, &mut s)?;
        let size = if root.is_null() {
            0
        } else {
            BpTree::attach(store, root).size(store)
        };
        if i >= size {
            return Err(LogicError::IndexOutOfBounds { index: i, size }.into());
        }
        Ok(BpTree::attach(store, root).get(store, i) as usize)
    }

    pub(crate) fn list_to_vec<T: Translate + ?Sized>(&self, store: &T, list: &LinkList) -> Result<Vec<usize>> {
        let mut s = list.inner.lock();
        let root = self.list_root(store, &mut s)?;
        if root.is_null() {
            return Ok(Vec::new());
        }
        Ok(BpTree::attach(store, root)
            .to_vec(store)
            .into_iter()
            .map(|v| v as usize)
            .collect())
    }

    /// Applies `op` to the list tree behind `list` and stores the resulting root.
    ///
    /// `op` receives the tree (created on demand) and its size before the edit.
    pub(crate) fn list_update<F>(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, list: &LinkList, op: F) -> Result<()>
    where
        F: FnOnce(&mut SlabAlloc, &TreeConfig, &mut BpTree, usize) -> Result<()>,
    {
        let handle = Arc::clone(&list.inner);
        let mut s = handle.lock();
        let root = self.list_root(alloc, &mut s)?;
        let mut tree = if root.is_null() {
            BpTree::create(alloc, false)?
        } else {
            BpTree::attach(alloc, root)
        };
        let size = tree.size(alloc);
        if let Err(err) = op(alloc, cfg, &mut tree, size) {
            if root.is_null() {
                tree.destroy(alloc);
            }
            return Err(err);
        }
        let new_root = if tree.is_empty(alloc) {
            tree.destroy(alloc);
            Ref::NULL
        } else {
            tree.root_ref()
        };
        if new_root != root {
            self.columns[s.col].set(alloc, cfg, s.row, new_root.to_element())?;
            self.sync_column(alloc, s.col)?;
        }
        s.root = new_root;
        Ok(())
    }

    /// Checks that every attached handle and column agrees with the nodes.
    pub(crate) fn check_accessors<T: Translate + ?Sized>(&mut self, store: &T, top: Ref) -> Result<()> {
        if self.state == AccessorState::Detached {
            return Err(StoreError::Corruption("live table accessor is detached"));
        }
        if self.state == AccessorState::Attached {
            if self.top.node_ref() != top {
                return Err(StoreError::Corruption("table accessor caches a stale top ref"));
            }
            for column in &self.columns {
                if column.is_marked() {
                    return Err(StoreError::Corruption("attached table holds a marked column"));
                }
                if self.slots.get_ref(store, column.ndx_in_parent()) != Some(column.root_ref()) {
                    return Err(StoreError::Corruption("column accessor caches a stale root"));
                }
                if column.size(store) != self.row_count {
                    return Err(StoreError::Corruption("column length differs from row count"));
                }
            }
        }
        let rows = self.row_count;
        let mut stray_row = false;
        self.rows.for_each(|s| stray_row |= s.state.is_attached() && s.row >= rows);
        if stray_row {
            return Err(StoreError::Corruption("row accessor past the end"));
        }
        let attached = self.state == AccessorState::Attached;
        let columns = &self.columns;
        let mut finding = None;
        self.link_lists.for_each(|s| {
            if !s.state.is_attached() || finding.is_some() {
                return;
            }
            if s.row >= rows || s.col >= columns.len() || !columns[s.col].kind().has_refs() {
                finding = Some("link list accessor names no list cell");
            } else if attached && s.state == AccessorState::Attached {
                let cell = columns[s.col].get(store, s.row);
                if Ref::from_element(cell).unwrap_or(Ref::NULL) != s.root {
                    finding = Some("link list accessor caches a stale root");
                }
            }
        });
        match finding {
            Some(msg) => Err(StoreError::Corruption(msg)),
            None => Ok(()),
        }
    }
}

/// Read access to one table, resolved through any [`Translate`] store.
///
/// Obtained from [`crate::storage::TableMut::view`], [`crate::storage::Group::table`]
/// or [`crate::storage::TableReader::view`].
pub struct TableView<'a, S: Translate + ?Sized> {
    store: &'a S,
    table: &'a Table,
}

impl<'a, S: Translate + ?Sized> TableView<'a, S> {
    pub(crate) fn new(store: &'a S, table: &'a Table) -> Self {
        Self { store, table }
    }

    /// Number of rows.
    pub fn size(&self) -> usize {
        self.table.row_count()
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.table.column_count()
    }

    /// Kind of column `col`.
    pub fn column_kind(&self, col: usize) -> Result<ColumnKind> {
        self.table.column_kind(col)
    }

    /// Whether column `col` carries a search index.
    pub fn has_search_index(&self, col: usize) -> Result<bool> {
        Ok(self.table.column(col)?.has_search_index())
    }

    /// Persisted index flags of column `col`.
    pub fn column_flags(&self, col: usize) -> Result<ColumnFlags> {
        Ok(self.table.column(col)?.flags())
    }

    fn typed(&self, col: usize, row: usize, accept: fn(ColumnKind) -> bool) -> Result<i64> {
        if !accept(self.table.column_kind(col)?) {
            return Err(LogicError::ColumnKindMismatch.into());
        }
        self.table.get(self.store, col, row)
    }

    /// Value of an Int cell.
    pub fn get_int(&self, col: usize, row: usize) -> Result<i64> {
        self.typed(col, row, |k| k == ColumnKind::Int)
    }

    /// Value of a Bool cell.
    pub fn get_bool(&self, col: usize, row: usize) -> Result<bool> {
        Ok(self.typed(col, row, |k| k == ColumnKind::Bool)? != 0)
    }

    /// Target row of a link cell; `None` for a null link.
    pub fn get_link(&self, col: usize, row: usize) -> Result<Option<usize>> {
        let v = self.typed(col, row, |k| matches!(k, ColumnKind::Link { .. }))?;
        Ok((v != 0).then(|| v as usize - 1))
    }

    /// Target rows held by a link-list cell.
    pub fn link_values(&self, col: usize, row: usize) -> Result<Vec<usize>> {
        self.table.list_values(self.store, col, row)
    }

    /// Every stored value of column `col` in row order.
    ///
    /// Link cells hold `row + 1`; link-list cells hold list root refs.
    pub fn column_values(&self, col: usize) -> Result<Vec<i64>> {
        Ok(self.table.column(col)?.to_vec(self.store))
    }

    /// Shape of the column's tree.
    pub fn column_shape(&self, col: usize) -> Result<TreeShape> {
        Ok(self.table.column(col)?.shape(self.store))
    }

    fn searchable(&self, col: usize) -> Result<&'a Column> {
        let column = self.table.column(col)?;
        if !column.kind().supports_search_index() {
            return Err(LogicError::ColumnKindMismatch.into());
        }
        Ok(column)
    }

    /// First row holding `value`.
    pub fn find_first(&self, col: usize, value: i64) -> Result<Option<usize>> {
        Ok(self.searchable(col)?.find_first(self.store, value))
    }

    /// Every row holding `value`, ascending.
    pub fn find_all(&self, col: usize, value: i64) -> Result<Vec<usize>> {
        Ok(self.searchable(col)?.find_all(self.store, value))
    }

    /// Number of rows holding `value`.
    pub fn count(&self, col: usize, value: i64) -> Result<usize> {
        Ok(self.searchable(col)?.count(self.store, value))
    }

    /// First row not less than `value`; the column must be sorted.
    pub fn lower_bound(&self, col: usize, value: i64) -> Result<usize> {
        Ok(self.searchable(col)?.lower_bound(self.store, value))
    }

    /// First row greater than `value`; the column must be sorted.
    pub fn upper_bound(&self, col: usize, value: i64) -> Result<usize> {
        Ok(self.searchable(col)?.upper_bound(self.store, value))
    }
}

fn remove_all(alloc: &mut SlabAlloc, cfg: &TreeConfig, list: &mut BpTree, value: i64) -> Result<()> {
    let mut hits = Vec::new();
    list.find_all::<Equal, _>(alloc, value, 0, list.size(alloc), &mut hits);
    for hit in hits.into_iter().rev() {
        list.erase(alloc, cfg, hit)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::alloc::{AllocOptions, Image};

    fn fresh_alloc() -> SlabAlloc {
        SlabAlloc::new(Arc::new(Image::with_reserved_prefix(32)), AllocOptions::default())
    }

    fn table_with(alloc: &mut SlabAlloc, cfg: &TreeConfig, kinds: &[ColumnKind], rows: usize) -> Table {
        let mut table = Table::create(alloc).unwrap();
        for (c, kind) in kinds.iter().enumerate() {
            table.insert_column(alloc, cfg, c, *kind).unwrap();
        }
        table.insert_rows(alloc, cfg, 0, rows).unwrap();
        table
    }

    #[test]
    fn top_ref_tracks_every_mutation() {
        let mut alloc = fresh_alloc();
        let cfg = TreeConfig::new(4);
        let mut table = table_with(&mut alloc, &cfg, &[ColumnKind::Int, ColumnKind::Bool], 10);
        for row in 0..10 {
            table.set(&mut alloc, &cfg, 0, row, row as i64 * 100).unwrap();
        }
        table.erase_row(&mut alloc, &cfg, 3).unwrap();
        let reread = Table::attach(&alloc, table.top_ref(), u64::MAX).unwrap();
        assert_eq!(reread.row_count(), 9);
        assert_eq!(reread.column_kind(1).unwrap(), ColumnKind::Bool);
        assert_eq!(reread.get(&alloc, 0, 3).unwrap(), 400);
    }

    #[test]
    fn index_slots_follow_column_inserts() {
        let mut alloc = fresh_alloc();
        let cfg = TreeConfig::new(4);
        let mut table = table_with(&mut alloc, &cfg, &[ColumnKind::Int, ColumnKind::Int], 3);
        table.add_search_index(&mut alloc, &cfg, 0, false).unwrap();
        table.insert_column(&mut alloc, &cfg, 0, ColumnKind::Bool).unwrap();
        assert_eq!(table.columns()[1].ndx_in_parent(), 1);
        assert_eq!(table.columns()[2].ndx_in_parent(), 3);
        table.set(&mut alloc, &cfg, 1, 2, 7).unwrap();
        let reread = Table::attach(&alloc, table.top_ref(), u64::MAX).unwrap();
        assert_eq!(reread.columns()[1].find_first(&alloc, 7), Some(2));
        table.remove_search_index(&mut alloc, 1).unwrap();
        assert!(matches!(
            table.remove_search_index(&mut alloc, 1),
            Err(StoreError::Logic(LogicError::NoSearchIndex))
        ));
        let reread = Table::attach(&alloc, table.top_ref(), u64::MAX).unwrap();
        assert_eq!(reread.columns()[2].ndx_in_parent(), 2);
    }

    #[test]
    fn unique_index_blocks_default_rows_up_front() {
        let mut alloc = fresh_alloc();
        let cfg = TreeConfig::new(4);
        let mut table = table_with(&mut alloc, &cfg, &[ColumnKind::Bool, ColumnKind::Int], 1);
        table.add_search_index(&mut alloc, &cfg, 1, true).unwrap();
        let top = table.top_ref();
        assert!(matches!(
            table.insert_rows(&mut alloc, &cfg, 1, 1),
            Err(StoreError::DuplicateValue(0))
        ));
        assert_eq!(table.top_ref(), top);
        assert_eq!(table.columns()[0].size(&alloc), 1);
    }

    #[test]
    fn link_fixups_follow_target_rows() {
        let mut alloc = fresh_alloc();
        let cfg = TreeConfig::new(4);
        let kinds = [ColumnKind::Link { target: 7 }, ColumnKind::LinkList { target: 7 }];
        let mut table = table_with(&mut alloc, &cfg, &kinds, 4);
        for (row, link) in [(0, 1), (1, 3), (2, 5), (3, 0)] {
            table.set(&mut alloc, &cfg, 0, row, link).unwrap();
        }
        let list = table.link_list(&alloc, 0, 1).unwrap();
        table
            .list_update(&mut alloc, &cfg, &list, |alloc, cfg, tree, _| {
                for v in [0, 2, 4, 2] {
                    tree.add(alloc, cfg, v)?;
                }
                Ok(())
            })
            .unwrap();

        table
            .apply_link_change(&mut alloc, &cfg, 7, RowChange::Erased { row: 2 })
            .unwrap();
        let links: Vec<i64> = (0..4).map(|r| table.get(&alloc, 0, r).unwrap()).collect();
        assert_eq!(links, vec![1, 0, 4, 0]);
        assert!(list.is_marked());
        assert_eq!(table.list_to_vec(&alloc, &list).unwrap(), vec![0, 3]);

        table
            .apply_link_change(&mut alloc, &cfg, 7, RowChange::Moved { row: 0, last: 3 })
            .unwrap();
        let links: Vec<i64> = (0..4).map(|r| table.get(&alloc, 0, r).unwrap()).collect();
        assert_eq!(links, vec![0, 0, 1, 0]);
        assert_eq!(table.list_to_vec(&alloc, &list).unwrap(), vec![0]);

        table
            .apply_link_change(&mut alloc, &cfg, 7, RowChange::Inserted { row: 0, n: 2 })
            .unwrap();
        assert_eq!(table.get(&alloc, 0, 2).unwrap(), 3);
        assert_eq!(table.list_to_vec(&alloc, &list).unwrap(), vec![2]);

        table.apply_link_change(&mut alloc, &cfg, 7, RowChange::Cleared).unwrap();
        assert_eq!(table.get(&alloc, 0, 2).unwrap(), 0);
        assert_eq!(table.list_len(&alloc, &list).unwrap(), 0);
        assert_eq!(table.get(&alloc, 1, 0).unwrap(), 0);
        table.check_accessors(&alloc, table.top_ref()).unwrap();
    }

    #[test]
    fn row_handles_follow_erase_and_move() {
        let mut alloc = fresh_alloc();
        let cfg = TreeConfig::new(4);
        let mut table = table_with(&mut alloc, &cfg, &[ColumnKind::Int], 5);
        let handles: Vec<Row> = (0..5).map(|r| table.row(r).unwrap()).collect();
        table.erase_row(&mut alloc, &cfg, 1).unwrap();
        table.move_last_over(&mut alloc, &cfg, 0).unwrap();
        assert!(!handles[0].is_attached());
        assert!(!handles[1].is_attached());
        assert_eq!(handles[2].index().unwrap(), 1);
        assert_eq!(handles[3].index().unwrap(), 2);
        assert_eq!(handles[4].index().unwrap(), 0);
        table.remove_column(&mut alloc, 0).unwrap();
        assert_eq!(table.row_count(), 0);
        assert!(!handles[4].is_attached());
    }
}

#![forbid(unsafe_code)]
//! The transaction shell: a set of tables under one top ref.
//!
//! A [`Group`] owns the writer's [`SlabAlloc`] and the accessor tree of every
//! table. Mutations run against mutable slab memory; `commit` deep-writes
//! what changed into a new image segment (and the file, when there is one),
//! advances the allocator's baseline and marks every accessor stale. Marked
//! tables refresh lazily, top-down, the next time they are touched.
//!
//! Group top node: `[tables, version]`.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::alloc::{AllocStats, Image, SlabAlloc};
use crate::primitives::file::{self, assemble_file, DbFile, FILE_HEADER_LEN};
use crate::storage::accessor::{AccessorState, LinkList, Registry, Row, TableRef, TableRefState};
use crate::storage::array::{encode_node, Array, NodeKind};
use crate::storage::bptree::TreeConfig;
use crate::storage::column::{ColumnFlags, ColumnKind};
use crate::storage::options::DbOptions;
use crate::storage::read::ReadView;
use crate::storage::stats::TreeStatsSnapshot;
use crate::storage::table::{RowChange, Table, TableView};
use crate::storage::verify::{verify_group, VerifySummary};
use crate::storage::writer::{write_deep, ArrayWriter, ImageWriter};
use crate::types::{from_tagged, to_tagged, LogicError, Ref, Result, StoreError};

pub(crate) const TOP_TABLES: usize = 0;
pub(crate) const TOP_VERSION: usize = 1;

/// Point-in-time counters of a group.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct GroupStats {
    /// Last committed version.
    pub version: u64,
    /// Number of tables in the current write.
    pub table_count: usize,
    /// Whether a failed mutation is waiting for rollback.
    pub poisoned: bool,
    /// Allocator counters.
    pub alloc: AllocStats,
    /// Structural tree counters since the group was opened.
    pub tree: TreeStatsSnapshot,
}

/// A database: tables, the writer's allocator and the committed image.
pub struct Group {
    alloc: SlabAlloc,
    cfg: TreeConfig,
    options: DbOptions,
    file: Option<DbFile>,
    top: Array,
    tables_arr: Array,
    tables: Vec<Table>,
    table_refs: Registry<TableRefState>,
    committed_top: Ref,
    version: u64,
    poisoned: bool,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("version", &self.version)
            .field("tables", &self.tables.len())
            .field("file_backed", &self.file.is_some())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl Group {
    /// An empty in-memory group with default options.
    pub fn new() -> Self {
        Self::with_options(DbOptions::default())
    }

    /// An empty in-memory group.
    pub fn with_options(options: DbOptions) -> Self {
        let tables = encode_node(NodeKind::HasRefs, false, &[]);
        let tables_ref = Ref(FILE_HEADER_LEN as u64);
        let top_ref = Ref(tables_ref.0 + tables.len() as u64);
        let mut nodes = tables;
        nodes.extend(encode_node(
            NodeKind::HasRefs,
            false,
            &[tables_ref.to_element(), to_tagged(0)],
        ));
        let image = Image::from_bytes(assemble_file(top_ref, &nodes).into());
        let alloc = SlabAlloc::new(Arc::new(image), options.alloc_options());
        Group {
            top: Array::attach(&alloc, top_ref),
            tables_arr: Array::attach(&alloc, tables_ref),
            cfg: TreeConfig::new(options.max_node_size),
            alloc,
            options,
            file: None,
            tables: Vec::new(),
            table_refs: Registry::default(),
            committed_top: top_ref,
            version: 0,
            poisoned: false,
        }
    }

    /// Creates (or truncates) a database file at `path`.
    pub fn create(path: impl AsRef<Path>, options: DbOptions) -> Result<Self> {
        let db = DbFile::create(path.as_ref(), options.sync_on_commit)?;
        let bytes = db.map_readonly()?;
        Self::load(bytes, Ref::NULL, Some(db), options)
    }

    /// Opens an existing database file.
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> Result<Self> {
        let db = DbFile::open(path.as_ref(), options.sync_on_commit)?;
        let bytes = db.map_readonly()?;
        let top = db.read_top_ref();
        let group = Self::load(bytes, top, Some(db), options)?;
        info!(
            target: "colstore::group",
            path = %path.as_ref().display(),
            tables = group.tables.len(),
            version = group.version,
            "group.open"
        );
        Ok(group)
    }

    /// Opens an in-memory group from a complete file image.
    pub fn from_bytes(bytes: Vec<u8>, options: DbOptions) -> Result<Self> {
        if bytes.len() < FILE_HEADER_LEN || bytes.len() % 8 != 0 {
            return Err(StoreError::InvalidDatabase("image length invalid"));
        }
        let top = file::read_top_ref(&bytes)?;
        if top.0 >= bytes.len() as u64 {
            return Err(StoreError::InvalidDatabase("top ref beyond end of image"));
        }
        Self::load(bytes.into(), top, None, options)
    }

    fn load(bytes: Arc<[u8]>, top: Ref, file: Option<DbFile>, options: DbOptions) -> Result<Self> {
        let image = Arc::new(Image::from_bytes(bytes));
        if options.verify_on_open && !top.is_null() {
            let summary = verify_group(&*image, top, image.len());
            if !summary.is_ok() {
                warn!(
                    target: "colstore::group",
                    findings = summary.findings.len(),
                    first = summary.findings.first().map(String::as_str).unwrap_or(""),
                    "group.open.verify_failed"
                );
                return Err(StoreError::InvalidDatabase("structural verification failed"));
            }
        }
        let mut alloc = SlabAlloc::new(image, options.alloc_options());
        let (top_arr, tables_arr, tables, version) = attach_committed(&mut alloc, top, 0)?;
        Ok(Group {
            alloc,
            cfg: TreeConfig::new(options.max_node_size),
            options,
            file,
            top: top_arr,
            tables_arr,
            tables,
            table_refs: Registry::default(),
            committed_top: top,
            version,
            poisoned: false,
        })
    }

    /// Options the group was opened with.
    pub fn options(&self) -> &DbOptions {
        &self.options
    }

    /// Last committed version; 0 before the first commit.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether a failed mutation requires [`Group::rollback`].
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Number of tables.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Runs `f` as one mutation; failures other than caller misuse poison the write.
    fn guarded<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        if self.poisoned {
            return Err(StoreError::NeedsRollback);
        }
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                if !matches!(err, StoreError::Logic(_) | StoreError::DuplicateValue(_)) {
                    self.poisoned = true;
                    warn!(target: "colstore::group", error = %err, "group.write.poisoned");
                }
                Err(err)
            }
        }
    }

    /// Fails while poisoned: a failed mutation may have stopped between
    /// rewriting a node and updating its parent, so only the committed
    /// version (see [`Group::pin_read`]) is trustworthy until rollback.
    fn ensure_readable(&self) -> Result<()> {
        if self.poisoned {
            return Err(StoreError::NeedsRollback);
        }
        Ok(())
    }

    /// Refreshes table `ndx` if a commit or rollback marked it.
    fn fresh(&mut self, ndx: usize) -> Result<()> {
        let table = self.tables.get_mut(ndx).ok_or(LogicError::TableOutOfBounds)?;
        if table.is_marked() {
            let r = self
                .tables_arr
                .get_ref(&self.alloc, ndx)
                .ok_or(StoreError::Corruption("table list holds a null ref"))?;
            table.refresh(&self.alloc, r)?;
        }
        Ok(())
    }

    fn fresh_all(&mut self) -> Result<()> {
        (0..self.tables.len()).try_for_each(|ndx| self.fresh(ndx))
    }

    fn sync_table(&mut self, ndx: usize) -> Result<()> {
        let r = self.tables[ndx].top_ref();
        self.tables_arr.set(&mut self.alloc, ndx, r.to_element())?;
        self.sync_tables_slot()
    }

    fn sync_tables_slot(&mut self) -> Result<()> {
        let r = self.tables_arr.node_ref();
        self.top.set(&mut self.alloc, TOP_TABLES, r.to_element())
    }

    /// Appends an empty table and returns its index.
    pub fn add_table(&mut self) -> Result<usize> {
        let ndx = self.tables.len();
        self.insert_table(ndx)?;
        Ok(ndx)
    }

    /// Inserts an empty table at `ndx`; later tables and links to them shift up.
    pub fn insert_table(&mut self, ndx: usize) -> Result<()> {
        self.guarded(|g| {
            if ndx > g.tables.len() {
                return Err(LogicError::TableOutOfBounds.into());
            }
            g.fresh_all()?;
            let table = Table::create(&mut g.alloc)?;
            g.tables_arr.insert(&mut g.alloc, ndx, table.top_ref().to_element())?;
            g.tables.insert(ndx, table);
            g.table_refs.adj_accessors_insert_rows(ndx, 1);
            for u in 0..g.tables.len() {
                if u != ndx {
                    g.tables[u].retarget(&mut g.alloc, |t| if t >= ndx { t + 1 } else { t })?;
                    g.sync_table(u)?;
                }
            }
            g.sync_tables_slot()
        })
    }

    /// Removes table `ndx` and releases its nodes.
    ///
    /// Fails with [`LogicError::TableIsLinkTarget`] while another table links to it.
    pub fn remove_table(&mut self, ndx: usize) -> Result<()> {
        self.guarded(|g| {
            if ndx >= g.tables.len() {
                return Err(LogicError::TableOutOfBounds.into());
            }
            let linked = g
                .tables
                .iter()
                .enumerate()
                .any(|(u, t)| u != ndx && t.links_to(ndx));
            if linked {
                return Err(LogicError::TableIsLinkTarget.into());
            }
            g.fresh_all()?;
            let removed = g.tables_arr.get_ref(&g.alloc, ndx);
            g.tables_arr.erase(&mut g.alloc, ndx)?;
            let mut table = g.tables.remove(ndx);
            table.detach_accessors();
            if let Some(r) = removed {
                Array::destroy_deep_ref(&mut g.alloc, r);
            }
            g.table_refs.adj_accessors_erase_row(ndx);
            for u in 0..g.tables.len() {
                g.tables[u].retarget(&mut g.alloc, |t| if t > ndx { t - 1 } else { t })?;
                g.sync_table(u)?;
            }
            g.sync_tables_slot()
        })
    }

    /// A handle that follows table `ndx` as other tables come and go.
    pub fn table_ref(&mut self, ndx: usize) -> Result<TableRef> {
        if ndx >= self.tables.len() {
            return Err(LogicError::TableOutOfBounds.into());
        }
        let existing = self
            .table_refs
            .find(|s| s.state.is_attached() && s.table == ndx);
        let inner = match existing {
            Some(inner) => inner,
            None => self.table_refs.register(TableRefState {
                state: AccessorState::Attached,
                table: ndx,
            }),
        };
        Ok(TableRef { inner })
    }

    /// Read access to table `ndx`.
    ///
    /// Fails with [`StoreError::NeedsRollback`] while the write is poisoned.
    pub fn table(&mut self, ndx: usize) -> Result<TableView<'_, SlabAlloc>> {
        self.ensure_readable()?;
        self.fresh(ndx)?;
        Ok(TableView::new(&self.alloc, &self.tables[ndx]))
    }

    /// Write access to table `ndx`.
    ///
    /// Fails with [`StoreError::NeedsRollback`] while the write is poisoned.
    pub fn table_mut(&mut self, ndx: usize) -> Result<TableMut<'_>> {
        self.ensure_readable()?;
        self.fresh(ndx)?;
        Ok(TableMut { group: self, ndx })
    }

    /// Write access to the table a handle currently names.
    pub fn table_mut_by_ref(&mut self, table: &TableRef) -> Result<TableMut<'_>> {
        if !self.table_refs.contains(&table.inner) {
            return Err(LogicError::DetachedAccessor.into());
        }
        let ndx = table.index()?;
        self.table_mut(ndx)
    }

    /// Applies a row change to table `ndx`, then to every table linking to it.
    fn change_rows(&mut self, ndx: usize, change: RowChange) -> Result<()> {
        self.guarded(|g| {
            g.fresh(ndx)?;
            let table = &mut g.tables[ndx];
            let change = match change {
                RowChange::Moved { row, .. } => RowChange::Moved {
                    row,
                    last: table.row_count().saturating_sub(1),
                },
                other => other,
            };
            match change {
                RowChange::Inserted { row, n } => table.insert_rows(&mut g.alloc, &g.cfg, row, n)?,
                RowChange::Erased { row } => table.erase_row(&mut g.alloc, &g.cfg, row)?,
                RowChange::Moved { row, .. } => table.move_last_over(&mut g.alloc, &g.cfg, row)?,
                RowChange::Cleared => table.clear(&mut g.alloc)?,
            }
            g.sync_table(ndx)?;
            g.propagate(ndx, change)
        })
    }

    fn propagate(&mut self, target: usize, change: RowChange) -> Result<()> {
        for u in 0..self.tables.len() {
            if !self.tables[u].links_to(target) {
                continue;
            }
            self.fresh(u)?;
            self.tables[u].apply_link_change(&mut self.alloc, &self.cfg, target, change)?;
            self.sync_table(u)?;
        }
        Ok(())
    }

    /// Row count of `target`, refreshed; used to validate link values.
    fn target_rows(&mut self, target: usize) -> Result<usize> {
        self.fresh(target)?;
        Ok(self.tables[target].row_count())
    }

    fn list_owner(&mut self, list: &LinkList) -> Result<usize> {
        self.ensure_readable()?;
        let owner = self
            .tables
            .iter()
            .position(|t| t.owns_list(list))
            .ok_or(LogicError::DetachedAccessor)?;
        self.fresh(owner)?;
        Ok(owner)
    }

    /// Number of entries in a link list.
    pub fn list_len(&mut self, list: &LinkList) -> Result<usize> {
        let owner = self.list_owner(list)?;
        self.tables[owner].list_len(&self.alloc, list)
    }

    /// Target row at position `i` of a link list.
    pub fn list_get(&mut self, list: &LinkList, i: usize) -> Result<usize> {
        let owner = self.list_owner(list)?;
        self.tables[owner].list_get(&self.alloc, list, i)
    }

    /// Every target row of a link list.
    pub fn list_values(&mut self, list: &LinkList) -> Result<Vec<usize>> {
        let owner = self.list_owner(list)?;
        self.tables[owner].list_to_vec(&self.alloc, list)
    }

    fn list_edit<F>(&mut self, list: &LinkList, target_row: Option<usize>, op: F) -> Result<()>
    where
        F: FnOnce(&mut SlabAlloc, &TreeConfig, &mut crate::storage::bptree::BpTree, usize) -> Result<()>,
    {
        self.guarded(|g| {
            let owner = g.list_owner(list)?;
            if let Some(row) = target_row {
                let target = g.tables[owner].list_target(list)?;
                let rows = g.target_rows(target)?;
                if row >= rows {
                    return Err(LogicError::InvalidLinkTarget.into());
                }
            }
            g.tables[owner].list_update(&mut g.alloc, &g.cfg, list, op)?;
            g.sync_table(owner)
        })
    }

    /// Inserts a link to `target_row` at position `i`.
    pub fn list_insert(&mut self, list: &LinkList, i: usize, target_row: usize) -> Result<()> {
        self.list_edit(list, Some(target_row), |alloc, cfg, tree, size| {
            if i > size {
                return Err(LogicError::IndexOutOfBounds { index: i, size }.into());
            }
            tree.insert(alloc, cfg, i, target_row as i64)
        })
    }

    /// Appends a link to `target_row`.
    pub fn list_add(&mut self, list: &LinkList, target_row: usize) -> Result<()> {
        self.list_edit(list, Some(target_row), |alloc, cfg, tree, _| {
            tree.add(alloc, cfg, target_row as i64)
        })
    }

    /// Replaces the link at position `i`.
    pub fn list_set(&mut self, list: &LinkList, i: usize, target_row: usize) -> Result<()> {
        self.list_edit(list, Some(target_row), |alloc, cfg, tree, size| {
            if i >= size {
                return Err(LogicError::IndexOutOfBounds { index: i, size }.into());
            }
            tree.set(alloc, cfg, i, target_row as i64)
        })
    }

    /// Removes the link at position `i`.
    pub fn list_remove(&mut self, list: &LinkList, i: usize) -> Result<()> {
        self.list_edit(list, None, |alloc, cfg, tree, size| {
            if i >= size {
                return Err(LogicError::IndexOutOfBounds { index: i, size }.into());
            }
            tree.erase(alloc, cfg, i).map(|_| ())
        })
    }

    /// Removes every link of the list.
    pub fn list_clear(&mut self, list: &LinkList) -> Result<()> {
        self.list_edit(list, None, |alloc, _, tree, _| tree.clear(alloc))
    }

    /// Makes the current state durable and the new baseline. Returns the new version.
    pub fn commit(&mut self) -> Result<u64> {
        self.guarded(|g| {
            let version = g.version + 1;
            g.top.set(&mut g.alloc, TOP_VERSION, to_tagged(version))?;
            let base = g.alloc.image().len();
            let mut writer = ImageWriter::new(base);
            let top = write_deep(&g.alloc, g.top.node_ref(), true, &mut writer)?;
            let bytes = writer.into_bytes();
            let written = bytes.len();
            if let Some(db) = g.file.as_mut() {
                let offset = db.append_and_fsync(&bytes)?;
                if offset != base {
                    return Err(StoreError::Corruption("file length disagrees with image"));
                }
                db.commit_top_ref(top)?;
            }
            let image = Arc::new(g.alloc.image().append(bytes));
            g.alloc.advance_baseline(image);
            g.committed_top = top;
            g.version = version;
            g.top = Array::attach(&g.alloc, top);
            let tables = g
                .top
                .get_ref(&g.alloc, TOP_TABLES)
                .ok_or(StoreError::Corruption("committed top holds no table list"))?;
            g.tables_arr = Array::attach(&g.alloc, tables);
            for table in &mut g.tables {
                table.mark();
            }
            debug!(
                target: "colstore::group",
                version,
                top = top.0,
                bytes = written,
                tables = g.tables.len(),
                "group.commit"
            );
            Ok(version)
        })
    }

    /// Discards every change since the last commit.
    ///
    /// Row and link-list handles are detached; table handles are detached too,
    /// since the table set may differ from the one they followed.
    pub fn rollback(&mut self) -> Result<()> {
        if let Some(db) = &self.file {
            if db.len() != self.alloc.image().len() {
                // A failed commit left bytes past the committed image.
                let bytes = db.map_readonly()?;
                self.alloc = SlabAlloc::new(Arc::new(Image::from_bytes(bytes)), self.options.alloc_options());
            }
        }
        self.alloc.reset();
        for table in &mut self.tables {
            table.detach_accessors();
        }
        self.table_refs.detach_all();
        let (top, tables_arr, tables, version) = attach_committed(&mut self.alloc, self.committed_top, self.version)?;
        self.top = top;
        self.tables_arr = tables_arr;
        self.tables = tables;
        self.version = version;
        self.poisoned = false;
        debug!(target: "colstore::group", version = self.version, "group.rollback");
        Ok(())
    }

    /// A read view pinned to the last committed version.
    pub fn pin_read(&self) -> ReadView {
        ReadView::new(Arc::clone(self.alloc.image()), self.committed_top, self.version)
    }

    /// Serializes the current state as a compact standalone file.
    pub fn write_to_bytes(&self) -> Result<Vec<u8>> {
        self.ensure_readable()?;
        let mut writer = ImageWriter::new(FILE_HEADER_LEN as u64);
        let top = write_deep(&self.alloc, self.top.node_ref(), false, &mut writer)?;
        Ok(assemble_file(top, &writer.into_bytes()))
    }

    /// Serializes rows `offset..offset + size` of one Int or Bool column as a
    /// standalone file holding a single one-column table.
    pub fn write_column_slice(&mut self, table: usize, col: usize, offset: usize, size: usize) -> Result<Vec<u8>> {
        self.ensure_readable()?;
        self.fresh(table)?;
        let column = self.tables[table].column(col)?;
        let kind = column.kind();
        if kind.has_refs() || kind.link_target().is_some() {
            return Err(LogicError::ColumnKindMismatch.into());
        }
        let total = column.size(&self.alloc);
        let end = offset.saturating_add(size).min(total);
        let rows = end - offset.min(end);

        let mut w = ImageWriter::new(FILE_HEADER_LEN as u64);
        let root = column.write(&self.alloc, offset, size, self.cfg.max_node_size, &mut w)?;
        let spec = w.write_array(&encode_node(
            NodeKind::Normal,
            false,
            &[kind.to_spec(ColumnFlags::default())],
        ))?;
        let slots = w.write_array(&encode_node(NodeKind::HasRefs, false, &[root.to_element()]))?;
        let table_top = w.write_array(&encode_node(
            NodeKind::HasRefs,
            false,
            &[spec.to_element(), slots.to_element(), to_tagged(rows as u64)],
        ))?;
        let tables = w.write_array(&encode_node(NodeKind::HasRefs, false, &[table_top.to_element()]))?;
        let top = w.write_array(&encode_node(
            NodeKind::HasRefs,
            false,
            &[tables.to_element(), to_tagged(0)],
        ))?;
        debug!(target: "colstore::group", table, col, offset, rows, "group.write_column_slice");
        Ok(assemble_file(top, &w.into_bytes()))
    }

    /// Structural walk of the current state.
    pub fn verify(&self) -> VerifySummary {
        verify_group(&self.alloc, self.top.node_ref(), u64::MAX)
    }

    /// Checks every live accessor against the nodes it describes.
    pub fn check_accessor_consistency(&mut self) -> Result<()> {
        if self.tables_arr.size() != self.tables.len() {
            return Err(StoreError::Corruption("table accessors disagree with table list"));
        }
        let count = self.tables.len();
        let mut stray = false;
        self.table_refs
            .for_each(|s| stray |= s.state.is_attached() && s.table >= count);
        if stray {
            return Err(StoreError::Corruption("table handle past the end"));
        }
        for ndx in 0..count {
            let r = self
                .tables_arr
                .get_ref(&self.alloc, ndx)
                .ok_or(StoreError::Corruption("table list holds a null ref"))?;
            self.tables[ndx].check_accessors(&self.alloc, r)?;
        }
        Ok(())
    }

    /// Current counters.
    pub fn stats(&self) -> GroupStats {
        GroupStats {
            version: self.version,
            table_count: self.tables.len(),
            poisoned: self.poisoned,
            alloc: self.alloc.stats(),
            tree: self.cfg.stats.snapshot(),
        }
    }

    /// Emits tree counters through `tracing`.
    pub fn emit_stats(&self) {
        self.cfg.stats.emit_tracing();
    }
}

/// Mutable access to one table of a [`Group`].
///
/// Every mutation keeps the group's top ref current; row changes are
/// replayed on link columns of other tables before the call returns.
pub struct TableMut<'g> {
    group: &'g mut Group,
    ndx: usize,
}

impl<'g> TableMut<'g> {
    /// Index of the table in its group.
    pub fn index(&self) -> usize {
        self.ndx
    }

    /// Read access to the table.
    pub fn view(&self) -> TableView<'_, SlabAlloc> {
        TableView::new(&self.group.alloc, &self.group.tables[self.ndx])
    }

    /// Number of rows.
    pub fn size(&self) -> usize {
        self.group.tables[self.ndx].row_count()
    }

    fn mutate<R>(&mut self, f: impl FnOnce(&mut Table, &mut SlabAlloc, &TreeConfig) -> Result<R>) -> Result<R> {
        let ndx = self.ndx;
        self.group.guarded(|g| {
            g.fresh(ndx)?;
            let out = f(&mut g.tables[ndx], &mut g.alloc, &g.cfg)?;
            g.sync_table(ndx)?;
            Ok(out)
        })
    }

    fn check_kind(&self, kind: ColumnKind) -> Result<()> {
        match kind.link_target() {
            Some(t) if t >= self.group.tables.len() => Err(LogicError::TableOutOfBounds.into()),
            _ => Ok(()),
        }
    }

    /// Appends a column filled with default values; returns its index.
    pub fn add_column(&mut self, kind: ColumnKind) -> Result<usize> {
        let col = self.group.tables[self.ndx].column_count();
        self.insert_column(col, kind)?;
        Ok(col)
    }

    /// Inserts a column at `col`.
    pub fn insert_column(&mut self, col: usize, kind: ColumnKind) -> Result<()> {
        self.check_kind(kind)?;
        self.mutate(|t, alloc, cfg| t.insert_column(alloc, cfg, col, kind))
    }

    /// Removes column `col` and everything it owns.
    pub fn remove_column(&mut self, col: usize) -> Result<()> {
        self.mutate(|t, alloc, _| t.remove_column(alloc, col))
    }

    /// Appends one default row; returns its index.
    pub fn add_row(&mut self) -> Result<usize> {
        let row = self.size();
        self.insert_rows(row, 1)?;
        Ok(row)
    }

    /// Inserts `n` default rows before `row`.
    pub fn insert_rows(&mut self, row: usize, n: usize) -> Result<()> {
        self.group.change_rows(self.ndx, RowChange::Inserted { row, n })
    }

    /// Removes `row`, shifting later rows down.
    pub fn erase_row(&mut self, row: usize) -> Result<()> {
        self.group.change_rows(self.ndx, RowChange::Erased { row })
    }

    /// Removes `row` by moving the last row into its place.
    pub fn move_last_over(&mut self, row: usize) -> Result<()> {
        self.group.change_rows(self.ndx, RowChange::Moved { row, last: 0 })
    }

    /// Removes every row.
    pub fn clear(&mut self) -> Result<()> {
        self.group.change_rows(self.ndx, RowChange::Cleared)
    }

    fn set_typed(&mut self, col: usize, row: usize, value: i64, accept: fn(ColumnKind) -> bool) -> Result<()> {
        if !accept(self.group.tables[self.ndx].column_kind(col)?) {
            return Err(LogicError::ColumnKindMismatch.into());
        }
        self.mutate(|t, alloc, cfg| t.set(alloc, cfg, col, row, value))
    }

    /// Stores an Int value.
    pub fn set_int(&mut self, col: usize, row: usize, value: i64) -> Result<()> {
        self.set_typed(col, row, value, |k| k == ColumnKind::Int)
    }

    /// Stores a Bool value.
    pub fn set_bool(&mut self, col: usize, row: usize, value: bool) -> Result<()> {
        self.set_typed(col, row, i64::from(value), |k| k == ColumnKind::Bool)
    }

    /// Points a link cell at `target` (a row of the link's target table) or clears it.
    pub fn set_link(&mut self, col: usize, row: usize, target: Option<usize>) -> Result<()> {
        let kind = self.group.tables[self.ndx].column_kind(col)?;
        let ColumnKind::Link { target: table } = kind else {
            return Err(LogicError::ColumnKindMismatch.into());
        };
        let value = match target {
            Some(t) => {
                if t >= self.group.target_rows(table)? {
                    return Err(LogicError::InvalidLinkTarget.into());
                }
                t as i64 + 1
            }
            None => 0,
        };
        self.set_typed(col, row, value, |k| matches!(k, ColumnKind::Link { .. }))
    }

    /// A handle that follows `row` through later row changes.
    pub fn row(&mut self, row: usize) -> Result<Row> {
        self.group.tables[self.ndx].row(row)
    }

    /// Whether `row` was handed out by this table.
    pub fn owns_row(&self, row: &Row) -> bool {
        self.group.tables[self.ndx].owns_row(row)
    }

    /// A handle to the link list at (`row`, `col`).
    pub fn link_list(&mut self, col: usize, row: usize) -> Result<LinkList> {
        let g = &mut *self.group;
        g.tables[self.ndx].link_list(&g.alloc, row, col)
    }

    /// Attaches a search index to an Int or Bool column.
    pub fn add_search_index(&mut self, col: usize, unique: bool) -> Result<()> {
        self.mutate(|t, alloc, cfg| t.add_search_index(alloc, cfg, col, unique))
    }

    /// Drops the search index of column `col`.
    pub fn remove_search_index(&mut self, col: usize) -> Result<()> {
        self.mutate(|t, alloc, _| t.remove_search_index(alloc, col))
    }
}

/// Attaches the top, the table list and every table of the committed state,
/// or builds an empty top in slab memory when nothing was committed yet.
fn attach_committed(alloc: &mut SlabAlloc, committed: Ref, version: u64) -> Result<(Array, Array, Vec<Table>, u64)> {
    let limit = alloc.image().len();
    if committed.is_null() {
        let tables_arr = Array::create_empty(alloc, NodeKind::HasRefs)?;
        let top = Array::from_values(
            alloc,
            NodeKind::HasRefs,
            false,
            &[tables_arr.node_ref().to_element(), to_tagged(version)],
        )?;
        return Ok((top, tables_arr, Vec::new(), version));
    }
    let top = Array::try_attach(&*alloc, committed, limit)?;
    if !top.has_refs() || top.size() != 2 {
        return Err(StoreError::InvalidDatabase("group top has wrong shape"));
    }
    let tables_ref = top
        .get_ref(&*alloc, TOP_TABLES)
        .ok_or(StoreError::InvalidDatabase("group top holds no table list"))?;
    let tables_arr = Array::try_attach(&*alloc, tables_ref, limit)?;
    let mut tables = Vec::with_capacity(tables_arr.size());
    for ndx in 0..tables_arr.size() {
        let r = tables_arr
            .get_ref(&*alloc, ndx)
            .ok_or(StoreError::InvalidDatabase("table list holds a null ref"))?;
        tables.push(Table::attach(&*alloc, r, limit)?);
    }
    let version = from_tagged(top.get(&*alloc, TOP_VERSION));
    Ok((top, tables_arr, tables, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people_and_pets() -> Group {
        let mut g = Group::with_options(DbOptions::default().max_node_size(4));
        let people = g.add_table().unwrap();
        let pets = g.add_table().unwrap();
        {
            let mut t = g.table_mut(pets).unwrap();
            t.add_column(ColumnKind::Int).unwrap();
            t.insert_rows(0, 3).unwrap();
            for row in 0..3 {
                t.set_int(0, row, 10 + row as i64).unwrap();
            }
        }
        let mut t = g.table_mut(people).unwrap();
        t.add_column(ColumnKind::Int).unwrap();
        t.add_column(ColumnKind::Link { target: pets }).unwrap();
        t.insert_rows(0, 2).unwrap();
        t.set_link(1, 0, Some(2)).unwrap();
        t.set_link(1, 1, Some(0)).unwrap();
        g
    }

    #[test]
    fn commit_marks_and_lazily_refreshes() {
        let mut g = people_and_pets();
        g.commit().unwrap();
        assert_eq!(g.version(), 1);
        assert!(g.tables.iter().all(Table::is_marked));
        assert_eq!(g.table(0).unwrap().get_link(1, 0).unwrap(), Some(2));
        assert!(!g.tables[0].is_marked());
        assert!(g.tables[1].is_marked());
        g.check_accessor_consistency().unwrap();
        assert!(g.verify().is_ok());
    }

    #[test]
    fn erasing_a_target_row_fixes_links() {
        let mut g = people_and_pets();
        g.commit().unwrap();
        g.table_mut(1).unwrap().erase_row(0).unwrap();
        let people = g.table(0).unwrap();
        assert_eq!(people.get_link(1, 0).unwrap(), Some(1));
        assert_eq!(people.get_link(1, 1).unwrap(), None);
    }

    #[test]
    fn link_targets_are_bounds_checked() {
        let mut g = people_and_pets();
        let mut t = g.table_mut(0).unwrap();
        assert!(matches!(
            t.set_link(1, 0, Some(3)),
            Err(StoreError::Logic(LogicError::InvalidLinkTarget))
        ));
        assert!(matches!(
            t.add_column(ColumnKind::Link { target: 9 }),
            Err(StoreError::Logic(LogicError::TableOutOfBounds))
        ));
        assert!(!g.is_poisoned());
    }

    #[test]
    fn linked_tables_cannot_be_removed_and_links_retarget() {
        let mut g = people_and_pets();
        assert!(matches!(
            g.remove_table(1),
            Err(StoreError::Logic(LogicError::TableIsLinkTarget))
        ));
        let pets = g.table_ref(1).unwrap();
        g.insert_table(0).unwrap();
        assert_eq!(pets.index().unwrap(), 2);
        assert_eq!(g.table(1).unwrap().column_kind(1).unwrap(), ColumnKind::Link { target: 2 });
        g.remove_table(0).unwrap();
        assert_eq!(pets.index().unwrap(), 1);
        assert_eq!(g.table(0).unwrap().column_kind(1).unwrap(), ColumnKind::Link { target: 1 });
        g.commit().unwrap();
        let reopened = Group::from_bytes(g.write_to_bytes().unwrap(), DbOptions::default()).unwrap();
        assert_eq!(reopened.table_count(), 2);
    }

    #[test]
    fn rollback_restores_committed_state() {
        let mut g = people_and_pets();
        g.commit().unwrap();
        let row = g.table_mut(1).unwrap().row(2).unwrap();
        g.table_mut(1).unwrap().set_int(0, 2, 99).unwrap();
        g.add_table().unwrap();
        g.rollback().unwrap();
        assert_eq!(g.table_count(), 2);
        assert_eq!(g.table(1).unwrap().get_int(0, 2).unwrap(), 12);
        assert!(!row.is_attached());
        g.check_accessor_consistency().unwrap();
    }
}

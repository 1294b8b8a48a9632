#![forbid(unsafe_code)]
//! Read views pinned to a committed version.
//!
//! A [`ReadView`] holds its own `Arc` of the image it was taken from. Later
//! commits append segments to a *new* image, and copy-on-write guarantees no
//! byte of this one is rewritten, so a view never changes under its reader.

use std::sync::Arc;

use crate::primitives::alloc::{Image, Translate};
use crate::storage::array::Array;
use crate::storage::group::TOP_TABLES;
use crate::storage::table::{Table, TableView};
use crate::types::{LogicError, Ref, Result, StoreError};

/// An immutable snapshot of one committed version.
#[derive(Clone, Debug)]
pub struct ReadView {
    image: Arc<Image>,
    top: Ref,
    version: u64,
}

impl ReadView {
    pub(crate) fn new(image: Arc<Image>, top: Ref, version: u64) -> Self {
        Self { image, top, version }
    }

    /// Version the view is pinned to.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Top ref of the pinned version; null when nothing was committed.
    pub fn top_ref(&self) -> Ref {
        self.top
    }

    fn tables(&self) -> Option<Array> {
        if self.top.is_null() {
            return None;
        }
        let top = Array::attach(&*self.image, self.top);
        top.get_ref(&*self.image, TOP_TABLES)
            .map(|r| Array::attach(&*self.image, r))
    }

    /// Number of tables in the pinned version.
    pub fn table_count(&self) -> usize {
        self.tables().map_or(0, |t| t.size())
    }

    /// Opens table `ndx` of the pinned version.
    pub fn table(&self, ndx: usize) -> Result<TableReader> {
        let tables = self.tables().ok_or(LogicError::TableOutOfBounds)?;
        if ndx >= tables.size() {
            return Err(LogicError::TableOutOfBounds.into());
        }
        let r = tables
            .get_ref(&*self.image, ndx)
            .ok_or(StoreError::Corruption("table list holds a null ref"))?;
        let table = Table::attach(&*self.image, r, self.image.len())?;
        Ok(TableReader {
            image: Arc::clone(&self.image),
            table,
        })
    }
}

impl Translate for ReadView {
    fn translate(&self, r: Ref) -> &[u8] {
        self.image.translate(r)
    }

    fn is_read_only(&self, _r: Ref) -> bool {
        true
    }
}

/// One table of a [`ReadView`].
#[derive(Debug)]
pub struct TableReader {
    image: Arc<Image>,
    table: Table,
}

impl TableReader {
    /// Full read access to the table.
    pub fn view(&self) -> TableView<'_, Image> {
        TableView::new(&*self.image, &self.table)
    }

    /// Number of rows.
    pub fn size(&self) -> usize {
        self.table.row_count()
    }

    /// Value of an Int cell.
    pub fn get_int(&self, col: usize, row: usize) -> Result<i64> {
        self.view().get_int(col, row)
    }

    /// Value of a Bool cell.
    pub fn get_bool(&self, col: usize, row: usize) -> Result<bool> {
        self.view().get_bool(col, row)
    }

    /// Target row of a link cell.
    pub fn get_link(&self, col: usize, row: usize) -> Result<Option<usize>> {
        self.view().get_link(col, row)
    }

    /// Target rows of the link list at (`row`, `col`).
    pub fn link_list(&self, col: usize, row: usize) -> Result<Vec<usize>> {
        self.view().link_values(col, row)
    }

    /// Every stored value of column `col`.
    pub fn column_values(&self, col: usize) -> Result<Vec<i64>> {
        self.view().column_values(col)
    }
}

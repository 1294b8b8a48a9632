use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_group;
use crate::admin::Result;
use crate::primitives::alloc::AllocStats;

/// Everything `stats` reports about one database.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// File-level facts.
    pub file: FileStats,
    /// Allocator counters right after opening.
    pub alloc: AllocStats,
    /// One entry per table.
    pub tables: Vec<TableStats>,
}

/// File-level facts.
#[derive(Debug, Clone, Serialize)]
pub struct FileStats {
    pub path: String,
    pub size_bytes: u64,
    pub version: u64,
    pub top_ref: u64,
}

/// Shape of one table.
#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    pub index: usize,
    pub rows: usize,
    pub columns: Vec<ColumnStats>,
}

/// Shape of one column tree.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnStats {
    pub index: usize,
    pub kind: String,
    pub indexed: bool,
    pub unique: bool,
    pub depth: usize,
    pub leaves: usize,
    pub inner_nodes: usize,
}

/// Collects per-table and per-column statistics of the committed version.
pub fn stats(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<StatsReport> {
    let path = path.as_ref();
    let group = open_group(path, opts)?;
    let db_meta = fs::metadata(path)?;
    let view = group.pin_read();

    let mut tables = Vec::with_capacity(view.table_count());
    for index in 0..view.table_count() {
        let reader = view.table(index)?;
        let table = reader.view();
        let mut columns = Vec::with_capacity(table.column_count());
        for col in 0..table.column_count() {
            let shape = table.column_shape(col)?;
            let flags = table.column_flags(col)?;
            columns.push(ColumnStats {
                index: col,
                kind: table.column_kind(col)?.to_string(),
                indexed: flags.indexed,
                unique: flags.unique,
                depth: shape.depth,
                leaves: shape.leaves,
                inner_nodes: shape.inner_nodes,
            });
        }
        tables.push(TableStats {
            index,
            rows: table.size(),
            columns,
        });
    }

    Ok(StatsReport {
        file: FileStats {
            path: path.display().to_string(),
            size_bytes: db_meta.len(),
            version: view.version(),
            top_ref: view.top_ref().0,
        },
        alloc: group.stats().alloc,
        tables,
    })
}

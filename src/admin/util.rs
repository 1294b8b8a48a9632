use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};

use crate::storage::{ColumnKind, Group, TableReader};

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;

/// Opens the database at `path`.
///
/// # Errors
///
/// Returns an error if the file does not exist or fails to open.
pub fn open_group(path: &Path, opts: &AdminOpenOptions) -> Result<Group> {
    if !path.exists() {
        return Err(AdminError::missing_database(path));
    }
    Ok(Group::open(path, opts.db.clone())?)
}

/// Contents of one table as printed by `dump`.
#[derive(Debug, Clone, Serialize)]
pub struct DumpTable {
    /// Table index.
    pub index: usize,
    /// Total rows, including rows past the dump limit.
    pub rows: usize,
    /// Column kinds.
    pub columns: Vec<String>,
    /// Leading rows, one JSON value per cell.
    pub values: Vec<Vec<Value>>,
}

/// Result of `dump`.
#[derive(Debug, Clone, Serialize)]
pub struct DumpReport {
    /// Committed version.
    pub version: u64,
    /// Every table.
    pub tables: Vec<DumpTable>,
}

/// Reads the committed contents of the database, at most `max_rows` rows per
/// table. `table` restricts the dump to one table.
///
/// # Errors
///
/// Fails with [`AdminError::TableOutOfRange`] when `table` names no table.
pub fn dump(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    table: Option<usize>,
    max_rows: usize,
) -> Result<DumpReport> {
    let group = open_group(path.as_ref(), opts)?;
    let view = group.pin_read();
    let selected = match table {
        Some(t) if t >= view.table_count() => {
            return Err(AdminError::TableOutOfRange {
                table: t,
                tables: view.table_count(),
            })
        }
        Some(t) => t..t + 1,
        None => 0..view.table_count(),
    };
    let mut tables = Vec::with_capacity(selected.len());
    for index in selected {
        let table = view.table(index)?;
        let kinds = (0..table.view().column_count())
            .map(|c| table.view().column_kind(c))
            .collect::<crate::types::Result<Vec<_>>>()?;
        let mut values = Vec::new();
        for row in 0..table.size().min(max_rows) {
            let cells = kinds
                .iter()
                .enumerate()
                .map(|(col, kind)| cell(&table, *kind, col, row))
                .collect::<crate::types::Result<Vec<_>>>()?;
            values.push(cells);
        }
        tables.push(DumpTable {
            index,
            rows: table.size(),
            columns: kinds.iter().map(ToString::to_string).collect(),
            values,
        });
    }
    Ok(DumpReport {
        version: view.version(),
        tables,
    })
}

fn cell(table: &TableReader, kind: ColumnKind, col: usize, row: usize) -> crate::types::Result<Value> {
    Ok(match kind {
        ColumnKind::Int => json!(table.get_int(col, row)?),
        ColumnKind::Bool => json!(table.get_bool(col, row)?),
        ColumnKind::Link { .. } => json!(table.get_link(col, row)?),
        ColumnKind::LinkList { .. } => json!(table.link_list(col, row)?),
    })
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

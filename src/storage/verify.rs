#![forbid(unsafe_code)]
//! Structural verification of a persisted group.
//!
//! The walk trusts nothing: every ref is attached through
//! [`Array::try_attach`] against the image length, and a problem in one
//! subtree is recorded as a finding without descending further. Checked:
//! node headers, group and table shapes, inner-node counts (compact and
//! general form), leaf width minimality, column lengths against the row
//! count, link bounds, search index contents, and that no node has two parents.

use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::primitives::alloc::Translate;
use crate::storage::array::{min_width, Array};
use crate::storage::column::{ColumnFlags, ColumnKind};
use crate::storage::table::{TOP_COLUMNS, TOP_ROWS, TOP_SPEC};
use crate::types::{from_tagged, Ref};

const MAX_FINDINGS: usize = 64;
const MAX_DEPTH: usize = 48;

/// Counts and findings of one verification walk.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifySummary {
    /// Nodes visited.
    pub nodes: u64,
    /// Bytes used by visited nodes.
    pub bytes: u64,
    /// Tables found.
    pub tables: usize,
    /// Columns found across all tables.
    pub columns: usize,
    /// Rows found across all tables.
    pub rows: u64,
    /// Problems found; empty when the group is sound.
    pub findings: Vec<String>,
}

impl VerifySummary {
    /// Whether no problem was found.
    pub fn is_ok(&self) -> bool {
        self.findings.is_empty()
    }

    fn push(&mut self, message: impl Into<String>) {
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(message.into());
        }
    }
}

struct ColumnInfo {
    kind: ColumnKind,
    flags: ColumnFlags,
    root: Ref,
    index: Option<Ref>,
}

struct TableInfo {
    rows: usize,
    columns: Vec<ColumnInfo>,
}

struct Walker<'a, T: ?Sized> {
    store: &'a T,
    limit: u64,
    seen: FxHashSet<u64>,
    summary: VerifySummary,
}

/// Verifies the group rooted at `top`; refs must lie below `limit`.
pub fn verify_group<T: Translate + ?Sized>(store: &T, top: Ref, limit: u64) -> VerifySummary {
    let mut w = Walker {
        store,
        limit,
        seen: FxHashSet::default(),
        summary: VerifySummary::default(),
    };
    if top.is_null() {
        return w.summary;
    }
    let Some(group) = w.node(top, "group top") else {
        return w.summary;
    };
    if !group.has_refs() || group.size() != 2 {
        w.summary.push(format!("group top {top} has wrong shape"));
        return w.summary;
    }
    if group.get(store, 1) & 1 == 0 {
        w.summary.push("group version slot is not tagged");
    }
    let Some(tables_ref) = group.get_ref(store, 0) else {
        w.summary.push("group top holds no table list");
        return w.summary;
    };
    let Some(tables) = w.node(tables_ref, "table list") else {
        return w.summary;
    };
    if !tables.has_refs() {
        w.summary.push("table list lacks refs flag");
        return w.summary;
    }
    let mut infos = Vec::with_capacity(tables.size());
    for t in 0..tables.size() {
        infos.push(tables.get_ref(store, t).and_then(|r| w.table(t, r)));
    }
    w.summary.tables = infos.len();
    let row_counts: Vec<Option<usize>> = infos.iter().map(|i| i.as_ref().map(|i| i.rows)).collect();
    for (t, info) in infos.iter().enumerate() {
        let Some(info) = info else {
            w.summary.push(format!("table {t} could not be read"));
            continue;
        };
        w.summary.columns += info.columns.len();
        w.summary.rows += info.rows as u64;
        for (c, col) in info.columns.iter().enumerate() {
            w.column(t, c, col, info.rows, &row_counts);
        }
    }
    w.summary
}

impl<T: Translate + ?Sized> Walker<'_, T> {
    fn node(&mut self, r: Ref, what: &str) -> Option<Array> {
        if !self.seen.insert(r.0) {
            self.summary.push(format!("{what} at {r} is reachable from two parents"));
            return None;
        }
        match Array::try_attach(self.store, r, self.limit) {
            Ok(node) => {
                self.summary.nodes += 1;
                self.summary.bytes += node.byte_size() as u64;
                Some(node)
            }
            Err(err) => {
                self.summary.push(format!("{what} at {r}: {err}"));
                None
            }
        }
    }

    fn table(&mut self, t: usize, r: Ref) -> Option<TableInfo> {
        let top = self.node(r, "table top")?;
        if !top.has_refs() || top.size() != 3 {
            self.summary.push(format!("table {t} top has wrong shape"));
            return None;
        }
        let rows_slot = top.get(self.store, TOP_ROWS);
        if rows_slot & 1 == 0 {
            self.summary.push(format!("table {t} row count is not tagged"));
            return None;
        }
        let spec = self.node(top.get_ref(self.store, TOP_SPEC)?, "column spec")?;
        let slots = self.node(top.get_ref(self.store, TOP_COLUMNS)?, "column list")?;
        if spec.has_refs() || !slots.has_refs() {
            self.summary.push(format!("table {t} spec or column list has wrong flags"));
            return None;
        }
        let mut columns = Vec::with_capacity(spec.size());
        let mut slot = 0;
        for c in 0..spec.size() {
            let (kind, flags) = match ColumnKind::from_spec(spec.get(self.store, c)) {
                Ok(decoded) => decoded,
                Err(err) => {
                    self.summary.push(format!("table {t} column {c}: {err}"));
                    return None;
                }
            };
            let needed = slot + 1 + usize::from(flags.indexed);
            if needed > slots.size() {
                self.summary.push(format!("table {t} column list too short"));
                return None;
            }
            let Some(root) = slots.get_ref(self.store, slot) else {
                self.summary.push(format!("table {t} column {c} has no root"));
                return None;
            };
            let index = if flags.indexed {
                slots.get_ref(self.store, slot + 1)
            } else {
                None
            };
            if flags.indexed && index.is_none() {
                self.summary.push(format!("table {t} column {c} has no index root"));
                return None;
            }
            columns.push(ColumnInfo {
                kind,
                flags,
                root,
                index,
            });
            slot = needed;
        }
        if slot != slots.size() {
            self.summary.push(format!("table {t} column list has {} extra slots", slots.size() - slot));
        }
        Some(TableInfo {
            rows: from_tagged(rows_slot) as usize,
            columns,
        })
    }

    fn column(&mut self, t: usize, c: usize, col: &ColumnInfo, rows: usize, row_counts: &[Option<usize>]) {
        let target_rows = match col.kind.link_target() {
            Some(target) => match row_counts.get(target) {
                Some(Some(n)) => Some(*n),
                _ => {
                    self.summary.push(format!("table {t} column {c} links to missing table {target}"));
                    return;
                }
            },
            None => None,
        };
        let mut values = Vec::with_capacity(rows);
        let Some(size) = self.tree(col.root, col.kind.has_refs(), &mut values) else {
            return;
        };
        if size != rows {
            self.summary
                .push(format!("table {t} column {c} holds {size} values for {rows} rows"));
            return;
        }
        match col.kind {
            ColumnKind::Int => {}
            ColumnKind::Bool => {
                if values.iter().any(|v| *v != 0 && *v != 1) {
                    self.summary.push(format!("table {t} column {c} holds a non-boolean value"));
                }
            }
            ColumnKind::Link { .. } => {
                let limit = target_rows.unwrap_or(0) as i64;
                if values.iter().any(|v| *v < 0 || *v > limit) {
                    self.summary.push(format!("table {t} column {c} holds a dangling link"));
                }
            }
            ColumnKind::LinkList { .. } => {
                let limit = target_rows.unwrap_or(0) as i64;
                for (row, cell) in values.iter().enumerate() {
                    if *cell == 0 {
                        continue;
                    }
                    let Some(list) = Ref::from_element(*cell) else {
                        self.summary.push(format!("table {t} column {c} row {row} holds a tagged value"));
                        continue;
                    };
                    let mut entries = Vec::new();
                    if self.tree(list, false, &mut entries).is_some()
                        && entries.iter().any(|v| *v < 0 || *v >= limit)
                    {
                        self.summary
                            .push(format!("table {t} column {c} row {row} lists a missing row"));
                    }
                }
            }
        }
        if let Some(index) = col.index {
            self.index(t, c, index, col.flags.unique, &values);
        }
    }

    fn index(&mut self, t: usize, c: usize, r: Ref, unique: bool, column: &[i64]) {
        let Some(root) = self.node(r, "search index") else {
            return;
        };
        if !root.has_refs() || root.size() != 2 || root.context_flag() != unique {
            self.summary.push(format!("table {t} column {c} index root has wrong shape"));
            return;
        }
        let (Some(values_ref), Some(rows_ref)) = (root.get_ref(self.store, 0), root.get_ref(self.store, 1)) else {
            self.summary.push(format!("table {t} column {c} index root lacks trees"));
            return;
        };
        let mut values = Vec::new();
        let mut rows = Vec::new();
        if self.tree(values_ref, false, &mut values).is_none() || self.tree(rows_ref, false, &mut rows).is_none() {
            return;
        }
        let mut expected: Vec<(i64, i64)> = column.iter().enumerate().map(|(row, v)| (*v, row as i64)).collect();
        expected.sort_unstable();
        let actual: Vec<(i64, i64)> = values.into_iter().zip(rows).collect();
        if actual != expected {
            self.summary.push(format!("table {t} column {c} index disagrees with column"));
        } else if unique && expected.windows(2).any(|w| w[0].0 == w[1].0) {
            self.summary.push(format!("table {t} column {c} unique index holds duplicates"));
        }
    }

    /// Walks the tree at `r`, appending its elements to `out`; returns its size.
    fn tree(&mut self, r: Ref, leaf_has_refs: bool, out: &mut Vec<i64>) -> Option<usize> {
        self.subtree(r, leaf_has_refs, 0, out)
    }

    fn subtree(&mut self, r: Ref, leaf_has_refs: bool, depth: usize, out: &mut Vec<i64>) -> Option<usize> {
        if depth > MAX_DEPTH {
            self.summary.push(format!("tree deeper than {MAX_DEPTH} levels at {r}"));
            return None;
        }
        let node = self.node(r, "tree node")?;
        if !node.is_inner_bptree_node() {
            if node.has_refs() != leaf_has_refs {
                self.summary.push(format!("leaf {r} has wrong refs flag"));
                return None;
            }
            if depth > 0 && node.is_empty() {
                self.summary.push(format!("empty non-root leaf {r}"));
            }
            let values = node.to_vec(self.store);
            if node.width() != min_width(&values) {
                self.summary.push(format!("leaf {r} is wider than its values need"));
            }
            out.extend_from_slice(&values);
            return Some(values.len());
        }
        if node.size() < 3 {
            self.summary.push(format!("inner node {r} has no children"));
            return None;
        }
        let elements = node.to_vec(self.store);
        let k = elements.len() - 2;
        let total_slot = elements[k + 1];
        if total_slot & 1 == 0 {
            self.summary.push(format!("inner node {r} total is not tagged"));
            return None;
        }
        let mut sizes = Vec::with_capacity(k);
        for (i, child) in elements[..k].iter().enumerate() {
            let Some(child) = Ref::from_element(*child) else {
                self.summary.push(format!("inner node {r} child {i} is not a ref"));
                return None;
            };
            sizes.push(self.subtree(child, leaf_has_refs, depth + 1, out)?);
        }
        let total: usize = sizes.iter().sum();
        if total != from_tagged(total_slot) as usize {
            self.summary.push(format!("inner node {r} total disagrees with children"));
        }
        let sizes_slot = elements[k];
        if sizes_slot & 1 == 1 {
            let epc = from_tagged(sizes_slot) as usize;
            let (last, rest) = sizes.split_last().unwrap_or((&0, &[]));
            if epc == 0 || *last > epc || rest.iter().any(|s| *s != epc) {
                self.summary.push(format!("inner node {r} violates its compact form"));
            }
        } else {
            let offsets = Ref::from_element(sizes_slot).and_then(|o| self.node(o, "offsets node"));
            let Some(offsets) = offsets else {
                self.summary.push(format!("inner node {r} lacks its offsets node"));
                return None;
            };
            let mut acc = 0i64;
            let expected: Vec<i64> = sizes[..k - 1]
                .iter()
                .map(|s| {
                    acc += *s as i64;
                    acc
                })
                .collect();
            if offsets.has_refs() || offsets.to_vec(self.store) != expected {
                self.summary.push(format!("inner node {r} offsets disagree with children"));
            }
        }
        Some(total)
    }
}

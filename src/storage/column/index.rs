//! Search index: (value, row) pairs kept sorted in two parallel B+-trees.
//!
//! The index root is a has-refs node `[values, rows]` whose context flag marks
//! a unique index. Entry `i` of both trees forms one pair; pairs are ordered
//! by value, then row.

use tracing::trace;

use crate::primitives::alloc::{SlabAlloc, Translate};
use crate::storage::array::{Array, NodeKind};
use crate::storage::bptree::{BpTree, TreeConfig};
use crate::types::{Ref, Result, StoreError};

/// Root accessor of one search index.
#[derive(Clone, Copy, Debug)]
pub struct SearchIndex {
    root: Array,
    values: BpTree,
    rows: BpTree,
}

impl SearchIndex {
    /// Builds an index over `column_values`, where element `i` belongs to row `i`.
    ///
    /// A unique index over duplicate values fails before anything is allocated.
    pub fn build(
        alloc: &mut SlabAlloc,
        cfg: &TreeConfig,
        column_values: &[i64],
        unique: bool,
    ) -> Result<SearchIndex> {
        let mut pairs: Vec<(i64, i64)> = column_values
            .iter()
            .enumerate()
            .map(|(row, v)| (*v, row as i64))
            .collect();
        pairs.sort_unstable();
        if unique {
            if let Some(w) = pairs.windows(2).find(|w| w[0].0 == w[1].0) {
                return Err(StoreError::DuplicateValue(w[0].0));
            }
        }
        let values: Vec<i64> = pairs.iter().map(|p| p.0).collect();
        let rows: Vec<i64> = pairs.iter().map(|p| p.1).collect();
        let values = BpTree::from_values(alloc, cfg, false, &values)?;
        let rows = BpTree::from_values(alloc, cfg, false, &rows)?;
        let root = Array::from_values(
            alloc,
            NodeKind::HasRefs,
            unique,
            &[values.root_ref().to_element(), rows.root_ref().to_element()],
        )?;
        trace!(
            target: "colstore::column",
            root = root.node_ref().0,
            entries = pairs.len(),
            unique,
            "built search index"
        );
        Ok(SearchIndex { root, values, rows })
    }

    /// Attaches to the index rooted at `r`.
    pub fn attach<T: Translate + ?Sized>(store: &T, r: Ref) -> SearchIndex {
        let root = Array::attach(store, r);
        debug_assert!(root.has_refs() && root.size() == 2, "malformed index root {r}");
        let values = BpTree::attach(store, Ref(root.get(store, 0) as u64));
        let rows = BpTree::attach(store, Ref(root.get(store, 1) as u64));
        SearchIndex { root, values, rows }
    }

    /// Root ref; changes whenever the root moves.
    pub fn root_ref(&self) -> Ref {
        self.root.node_ref()
    }

    /// Whether duplicate values are rejected.
    pub fn is_unique(&self) -> bool {
        self.root.context_flag()
    }

    /// Number of pairs.
    pub fn size<T: Translate + ?Sized>(&self, store: &T) -> usize {
        self.values.size(store)
    }

    /// Number of rows holding `value`.
    pub fn count<T: Translate + ?Sized>(&self, store: &T, value: i64) -> usize {
        self.values.upper_bound(store, value) - self.values.lower_bound(store, value)
    }

    /// Lowest row holding `value`.
    pub fn find_first<T: Translate + ?Sized>(&self, store: &T, value: i64) -> Option<usize> {
        let lb = self.values.lower_bound(store, value);
        if lb < self.values.size(store) && self.values.get(store, lb) == value {
            Some(self.rows.get(store, lb) as usize)
        } else {
            None
        }
    }

    /// Every row holding `value`, ascending.
    pub fn find_all<T: Translate + ?Sized>(&self, store: &T, value: i64) -> Vec<usize> {
        let lb = self.values.lower_bound(store, value);
        let ub = self.values.upper_bound(store, value);
        (lb..ub).map(|i| self.rows.get(store, i) as usize).collect()
    }

    /// All pairs in index order.
    pub fn entries<T: Translate + ?Sized>(&self, store: &T) -> Vec<(i64, usize)> {
        self.values
            .to_vec(store)
            .into_iter()
            .zip(self.rows.to_vec(store))
            .map(|(v, r)| (v, r as usize))
            .collect()
    }

    /// Fails with [`StoreError::DuplicateValue`] when a unique index already holds `value`.
    pub fn check_insert<T: Translate + ?Sized>(&self, store: &T, value: i64) -> Result<()> {
        if self.is_unique() && self.count(store, value) > 0 {
            return Err(StoreError::DuplicateValue(value));
        }
        Ok(())
    }

    /// A row was inserted at `row` holding `value`.
    ///
    /// Row numbers are stored by value, so every entry for a later row is
    /// rewritten: inserting or erasing anywhere but the end is O(n) in the
    /// table size. `benches/micro_column.rs` tracks it as `indexed_insert_front`.
    pub fn insert_row(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, row: usize, value: i64) -> Result<()> {
        self.rows.adjust_ge(alloc, cfg, row as i64, 1)?;
        self.insert_pair(alloc, cfg, value, row)?;
        self.sync(alloc)
    }

    /// Row `row` holding `value` was erased and later rows shifted down.
    pub fn erase_row(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, row: usize, value: i64) -> Result<()> {
        self.erase_pair(alloc, cfg, value, row)?;
        self.rows.adjust_ge(alloc, cfg, row as i64 + 1, -1)?;
        self.sync(alloc)
    }

    /// Row `last` holding `moved` replaced row `ndx` holding `removed`.
    pub fn move_last_over(
        &mut self,
        alloc: &mut SlabAlloc,
        cfg: &TreeConfig,
        ndx: usize,
        removed: i64,
        last: usize,
        moved: i64,
    ) -> Result<()> {
        self.erase_pair(alloc, cfg, removed, ndx)?;
        if ndx != last {
            self.erase_pair(alloc, cfg, moved, last)?;
            self.insert_pair(alloc, cfg, moved, ndx)?;
        }
        self.sync(alloc)
    }

    /// Row `row` changed from `old` to `new`.
    pub fn set(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, row: usize, old: i64, new: i64) -> Result<()> {
        if old == new {
            return Ok(());
        }
        self.erase_pair(alloc, cfg, old, row)?;
        self.insert_pair(alloc, cfg, new, row)?;
        self.sync(alloc)
    }

    /// Removes every pair.
    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.values.clear(alloc)?;
        self.rows.clear(alloc)?;
        self.sync(alloc)
    }

    /// Releases every node of the index.
    pub fn destroy(self, alloc: &mut SlabAlloc) {
        self.root.destroy_deep(alloc);
    }

    fn position<T: Translate + ?Sized>(&self, store: &T, value: i64, row: usize) -> usize {
        let (mut lo, mut hi) = (
            self.values.lower_bound(store, value),
            self.values.upper_bound(store, value),
        );
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if (self.rows.get(store, mid) as usize) < row {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn insert_pair(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, value: i64, row: usize) -> Result<()> {
        let pos = self.position(alloc, value, row);
        self.values.insert(alloc, cfg, pos, value)?;
        self.rows.insert(alloc, cfg, pos, row as i64)
    }

    fn erase_pair(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, value: i64, row: usize) -> Result<()> {
        let pos = self.position(alloc, value, row);
        if pos >= self.values.size(alloc)
            || self.values.get(alloc, pos) != value
            || self.rows.get(alloc, pos) as usize != row
        {
            return Err(StoreError::Corruption("search index lacks entry"));
        }
        self.values.erase(alloc, cfg, pos)?;
        self.rows.erase(alloc, cfg, pos)?;
        Ok(())
    }

    fn sync(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        for (slot, r) in [(0, self.values.root_ref()), (1, self.rows.root_ref())] {
            if self.root.get(alloc, slot) != r.to_element() {
                self.root.set(alloc, slot, r.to_element())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::alloc::{AllocOptions, Image};
    use std::sync::Arc;

    fn fresh_alloc() -> SlabAlloc {
        SlabAlloc::new(Arc::new(Image::with_reserved_prefix(32)), AllocOptions::default())
    }

    #[test]
    fn pairs_follow_row_shifts() {
        let mut alloc = fresh_alloc();
        let cfg = TreeConfig::new(4);
        let mut index = SearchIndex::build(&mut alloc, &cfg, &[5, 3, 5, 1], false).unwrap();
        assert_eq!(index.find_all(&alloc, 5), vec![0, 2]);
        index.insert_row(&mut alloc, &cfg, 1, 5).unwrap();
        assert_eq!(index.find_all(&alloc, 5), vec![0, 1, 3]);
        assert_eq!(index.find_first(&alloc, 3), Some(2));
        index.erase_row(&mut alloc, &cfg, 0, 5).unwrap();
        assert_eq!(index.find_all(&alloc, 5), vec![0, 2]);
        assert_eq!(index.entries(&alloc), vec![(1, 3), (3, 1), (5, 0), (5, 2)]);
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let mut alloc = fresh_alloc();
        let cfg = TreeConfig::new(4);
        assert!(matches!(
            SearchIndex::build(&mut alloc, &cfg, &[1, 2, 1], true),
            Err(StoreError::DuplicateValue(1))
        ));
        let index = SearchIndex::build(&mut alloc, &cfg, &[1, 2, 3], true).unwrap();
        assert!(index.is_unique());
        assert!(index.check_insert(&alloc, 2).is_err());
        assert!(index.check_insert(&alloc, 4).is_ok());
    }

    #[test]
    fn move_last_over_rewrites_moved_row() {
        let mut alloc = fresh_alloc();
        let cfg = TreeConfig::new(4);
        let mut index = SearchIndex::build(&mut alloc, &cfg, &[10, 20, 30, 40], false).unwrap();
        index.move_last_over(&mut alloc, &cfg, 1, 20, 3, 40).unwrap();
        assert_eq!(index.entries(&alloc), vec![(10, 0), (30, 2), (40, 1)]);
        index.set(&mut alloc, &cfg, 2, 30, 5).unwrap();
        assert_eq!(index.find_first(&alloc, 5), Some(2));
        assert_eq!(index.count(&alloc, 30), 0);
        let reattached = SearchIndex::attach(&alloc, index.root_ref());
        assert_eq!(reattached.entries(&alloc), index.entries(&alloc));
    }
}

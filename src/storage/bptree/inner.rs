//! Inner node layout: `[child_0 .. child_{k-1}, sizes, total]`.
//!
//! `total` is the tagged element count of the whole subtree. `sizes` is either
//! a tagged elements-per-child value (compact form: every child but the last
//! holds exactly that many, the last holds at most that many) or the ref of a
//! cumulative-count node with `k - 1` entries. The compact form is kept only
//! while appends preserve it; any other change converts to the general form.

use crate::primitives::alloc::{SlabAlloc, Translate};
use crate::storage::array::{Array, NodeKind};
use crate::types::{from_tagged, to_tagged, Ref, Result};

/// Accessor for one inner B+-tree node.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InnerNode {
    pub(crate) arr: Array,
}

impl InnerNode {
    pub(crate) fn new(arr: Array) -> Self {
        debug_assert!(arr.is_inner_bptree_node(), "node {} is not inner", arr.node_ref());
        debug_assert!(arr.size() >= 2, "inner node {} lacks trailer", arr.node_ref());
        Self { arr }
    }

    /// Allocates an inner node over `children` (ref, element count).
    pub(crate) fn build(alloc: &mut SlabAlloc, children: &[(Ref, usize)]) -> Result<InnerNode> {
        let elements = inner_elements(children, |cumulative| {
            Ok(Array::from_values(alloc, NodeKind::Normal, false, cumulative)?.node_ref())
        })?;
        let arr = Array::from_values(alloc, NodeKind::InnerBptree, false, &elements)?;
        Ok(InnerNode { arr })
    }

    pub(crate) fn child_count(&self) -> usize {
        self.arr.size() - 2
    }

    pub(crate) fn child_ref<T: Translate + ?Sized>(&self, store: &T, i: usize) -> Ref {
        let raw = self.arr.get(store, i);
        debug_assert!(
            Ref::from_element(raw).is_some(),
            "child {i} of inner node {} is not a ref",
            self.arr.node_ref()
        );
        Ref(raw as u64)
    }

    pub(crate) fn total<T: Translate + ?Sized>(&self, store: &T) -> usize {
        from_tagged(self.arr.back(store)) as usize
    }

    /// Elements per child when the node is in compact form.
    pub(crate) fn elems_per_child<T: Translate + ?Sized>(&self, store: &T) -> Option<usize> {
        let slot = self.arr.get(store, self.child_count());
        (slot & 1 == 1).then(|| from_tagged(slot) as usize)
    }

    /// The cumulative-count node when the node is in general form.
    pub(crate) fn offsets<T: Translate + ?Sized>(&self, store: &T) -> Option<Array> {
        let k = self.child_count();
        self.arr.get_ref(store, k).map(|r| {
            let mut offsets = Array::attach(store, r);
            offsets.set_ndx_in_parent(k);
            offsets
        })
    }

    /// Element count of every child, in order.
    pub(crate) fn child_sizes<T: Translate + ?Sized>(&self, store: &T) -> Vec<usize> {
        let k = self.child_count();
        let total = self.total(store);
        if k == 0 {
            return Vec::new();
        }
        if let Some(epc) = self.elems_per_child(store) {
            let mut sizes = vec![epc; k];
            sizes[k - 1] = total.saturating_sub(epc * (k - 1));
            return sizes;
        }
        let cumulative = self.offsets(store).map(|o| o.to_vec(store)).unwrap_or_default();
        let mut sizes = Vec::with_capacity(k);
        let mut prev = 0usize;
        for end in cumulative {
            sizes.push(end as usize - prev);
            prev = end as usize;
        }
        sizes.push(total.saturating_sub(prev));
        sizes
    }

    /// Logical index of the first element of child `i`.
    pub(crate) fn child_start<T: Translate + ?Sized>(&self, store: &T, i: usize) -> usize {
        if i == 0 {
            return 0;
        }
        match self.elems_per_child(store) {
            Some(epc) => epc * i,
            None => self
                .offsets(store)
                .map(|o| o.get(store, i - 1) as usize)
                .unwrap_or(0),
        }
    }

    /// Child holding logical index `ndx`, and the index within that child.
    ///
    /// `ndx == total` resolves to the end of the last child.
    pub(crate) fn find_child<T: Translate + ?Sized>(&self, store: &T, ndx: usize) -> (usize, usize) {
        let last = self.child_count() - 1;
        match self.elems_per_child(store) {
            Some(0) => (last, ndx),
            Some(epc) => {
                let i = (ndx / epc).min(last);
                (i, ndx - epc * i)
            }
            None => match self.offsets(store) {
                Some(offsets) => {
                    let i = offsets.upper_bound(store, ndx as i64).min(last);
                    let start = if i == 0 {
                        0
                    } else {
                        offsets.get(store, i - 1) as usize
                    };
                    (i, ndx - start)
                }
                None => (0, ndx),
            },
        }
    }

    /// Points child slot `i` at `r`; a no-op when it already does.
    pub(crate) fn set_child(&mut self, alloc: &mut SlabAlloc, i: usize, r: Ref) -> Result<()> {
        if self.arr.get(alloc, i) != r.to_element() {
            self.arr.set(alloc, i, r.to_element())?;
        }
        Ok(())
    }

    /// Child `i` gained or lost `delta` elements.
    pub(crate) fn adjust(&mut self, alloc: &mut SlabAlloc, i: usize, delta: isize) -> Result<()> {
        let mut sizes = self.child_sizes(alloc);
        sizes[i] = sizes[i].wrapping_add_signed(delta);
        self.store_sizes(alloc, &sizes)
    }

    /// Child `i` split: it now holds `left` elements and `right_ref` follows it.
    pub(crate) fn split_child(
        &mut self,
        alloc: &mut SlabAlloc,
        i: usize,
        left: usize,
        right_ref: Ref,
        right: usize,
    ) -> Result<()> {
        let mut sizes = self.child_sizes(alloc);
        sizes[i] = left;
        sizes.insert(i + 1, right);
        self.arr.insert(alloc, i + 1, right_ref.to_element())?;
        self.store_sizes(alloc, &sizes)
    }

    /// Unlinks child `i`; the caller owns destroying it.
    pub(crate) fn remove_child(&mut self, alloc: &mut SlabAlloc, i: usize) -> Result<()> {
        let mut sizes = self.child_sizes(alloc);
        sizes.remove(i);
        self.arr.erase(alloc, i)?;
        self.store_sizes(alloc, &sizes)
    }

    /// Children with their element counts.
    pub(crate) fn children<T: Translate + ?Sized>(&self, store: &T) -> Vec<(Ref, usize)> {
        let sizes = self.child_sizes(store);
        sizes
            .into_iter()
            .enumerate()
            .map(|(i, size)| (self.child_ref(store, i), size))
            .collect()
    }

    /// Releases this node and its cumulative-count node, leaving children alone.
    pub(crate) fn destroy_shallow(self, alloc: &mut SlabAlloc) {
        if let Some(offsets) = self.offsets(alloc) {
            offsets.destroy(alloc);
        }
        self.arr.destroy(alloc);
    }

    fn store_sizes(&mut self, alloc: &mut SlabAlloc, sizes: &[usize]) -> Result<()> {
        let k = self.child_count();
        debug_assert_eq!(k, sizes.len());
        let total: usize = sizes.iter().sum();
        let still_compact = match self.elems_per_child(alloc) {
            Some(epc) => fits_compact(sizes, epc),
            None => false,
        };
        if !still_compact {
            let cumulative = cumulative(sizes);
            match self.offsets(alloc) {
                Some(mut offsets) => {
                    offsets.assign(alloc, &cumulative)?;
                    self.set_child(alloc, k, offsets.node_ref())?;
                }
                None => {
                    let offsets = Array::from_values(alloc, NodeKind::Normal, false, &cumulative)?;
                    self.arr.set(alloc, k, offsets.node_ref().to_element())?;
                }
            }
        }
        let last = self.arr.size() - 1;
        self.arr.set(alloc, last, to_tagged(total as u64))
    }
}

fn fits_compact(sizes: &[usize], epc: usize) -> bool {
    match sizes.split_last() {
        None => true,
        Some((last, rest)) => epc > 0 && *last <= epc && rest.iter().all(|s| *s == epc),
    }
}

fn cumulative(sizes: &[usize]) -> Vec<i64> {
    let mut acc = 0usize;
    sizes[..sizes.len().saturating_sub(1)]
        .iter()
        .map(|s| {
            acc += s;
            acc as i64
        })
        .collect()
}

/// Element vector of an inner node over `children`.
///
/// Picks the compact form when the child sizes allow it; otherwise calls
/// `make_offsets` to create the cumulative-count node.
pub(crate) fn inner_elements<F>(children: &[(Ref, usize)], make_offsets: F) -> Result<Vec<i64>>
where
    F: FnOnce(&[i64]) -> Result<Ref>,
{
    let sizes: Vec<usize> = children.iter().map(|(_, s)| *s).collect();
    let total: usize = sizes.iter().sum();
    let epc = match sizes.len() {
        0 => 1,
        1 => sizes[0].max(1),
        _ => sizes[0],
    };
    let slot = if fits_compact(&sizes, epc) {
        to_tagged(epc as u64)
    } else {
        make_offsets(&cumulative(&sizes))?.to_element()
    };
    let mut elements: Vec<i64> = children.iter().map(|(r, _)| r.to_element()).collect();
    elements.push(slot);
    elements.push(to_tagged(total as u64));
    Ok(elements)
}

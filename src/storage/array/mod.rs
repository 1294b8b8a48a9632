#![forbid(unsafe_code)]
//! The physical B+-tree node: a packed vector of signed integers.
//!
//! An [`Array`] is an accessor, not the node itself. It caches the node's ref
//! and decoded header so repeated reads only pay for one translation. Any
//! operation that may move the node (copy-on-write, growth, re-pack) updates
//! the cached ref; the caller owns propagating the new ref into the parent's
//! child slot.

mod find;
pub(crate) mod width;

use tracing::trace;

use crate::primitives::alloc::{SlabAlloc, Translate};
use crate::types::node::{self, NodeHeader, HEADER_LEN, MAX_HEADER_FIELD};
use crate::types::{Ref, Result, StoreError};

pub use find::{Condition, Equal, Greater, Less, NotEqual};
pub use width::bit_width;

/// How the elements of a new node are interpreted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Plain integers.
    Normal,
    /// Elements are child refs or tagged integers.
    HasRefs,
    /// An inner B+-tree node (implies has-refs).
    InnerBptree,
}

impl NodeKind {
    fn flags(self) -> (bool, bool) {
        match self {
            NodeKind::Normal => (false, false),
            NodeKind::HasRefs => (true, false),
            NodeKind::InnerBptree => (true, true),
        }
    }
}

/// Accessor for one node.
#[derive(Clone, Copy, Debug)]
pub struct Array {
    r: Ref,
    header: NodeHeader,
    ndx_in_parent: usize,
}

impl Array {
    /// Allocates a node holding `size` copies of `value`.
    pub fn create(
        alloc: &mut SlabAlloc,
        kind: NodeKind,
        context: bool,
        size: usize,
        value: i64,
    ) -> Result<Array> {
        let values = vec![value; size];
        Self::from_values(alloc, kind, context, &values)
    }

    /// Allocates an empty node.
    pub fn create_empty(alloc: &mut SlabAlloc, kind: NodeKind) -> Result<Array> {
        Self::from_values(alloc, kind, false, &[])
    }

    /// Allocates a node holding `values` at their minimal width.
    pub fn from_values(
        alloc: &mut SlabAlloc,
        kind: NodeKind,
        context: bool,
        values: &[i64],
    ) -> Result<Array> {
        check_node_limits(
            values.len(),
            node::byte_size_for(values.len(), min_width(values)),
        )?;
        let bytes = encode_node(kind, context, values);
        let r = alloc.alloc(bytes.len())?;
        alloc.translate_mut(r)[..bytes.len()].copy_from_slice(&bytes);
        Ok(Array {
            r,
            header: NodeHeader::decode(&bytes),
            ndx_in_parent: 0,
        })
    }

    /// Attaches to an existing node.
    pub fn attach<T: Translate + ?Sized>(alloc: &T, r: Ref) -> Array {
        debug_assert!(!r.is_null(), "attach to null ref");
        let header = NodeHeader::decode(alloc.translate(r));
        debug_assert!(header.byte_size() <= header.capacity, "node {r} overflows capacity");
        Array {
            r,
            header,
            ndx_in_parent: 0,
        }
    }

    /// Attaches to a node read from untrusted bytes, validating its header.
    pub fn try_attach<T: Translate + ?Sized>(store: &T, r: Ref, limit: u64) -> Result<Array> {
        if r.is_null() || r.0 % node::NODE_ALIGN as u64 != 0 {
            return Err(StoreError::InvalidDatabase("misaligned or null ref"));
        }
        if r.0 + HEADER_LEN as u64 > limit {
            return Err(StoreError::InvalidDatabase("ref beyond end of image"));
        }
        let bytes = store.translate(r);
        if bytes.len() < HEADER_LEN {
            return Err(StoreError::InvalidDatabase("node header truncated"));
        }
        if bytes[node::header::RESERVED] != 0 {
            return Err(StoreError::InvalidDatabase("node header reserved byte set"));
        }
        let header = NodeHeader::decode(bytes);
        if header.inner_bptree && !header.has_refs {
            return Err(StoreError::InvalidDatabase("inner node without refs flag"));
        }
        if header.byte_size() > header.capacity || header.capacity > bytes.len() {
            return Err(StoreError::InvalidDatabase("node larger than its storage"));
        }
        Ok(Array {
            r,
            header,
            ndx_in_parent: 0,
        })
    }

    /// Re-reads the header after the node bytes changed underneath.
    pub fn refresh<T: Translate + ?Sized>(&mut self, alloc: &T, r: Ref) {
        let ndx = self.ndx_in_parent;
        *self = Array::attach(alloc, r);
        self.ndx_in_parent = ndx;
    }

    /// The node's current ref.
    pub fn node_ref(&self) -> Ref {
        self.r
    }

    /// Element count.
    pub fn size(&self) -> usize {
        self.header.size
    }

    /// Returns true when the node has no elements.
    pub fn is_empty(&self) -> bool {
        self.header.size == 0
    }

    /// Bits per element.
    pub fn width(&self) -> u8 {
        self.header.width
    }

    /// Whether elements may be child refs.
    pub fn has_refs(&self) -> bool {
        self.header.has_refs
    }

    /// Whether this is an inner B+-tree node.
    pub fn is_inner_bptree_node(&self) -> bool {
        self.header.inner_bptree
    }

    /// How the elements are interpreted.
    pub fn kind(&self) -> NodeKind {
        match (self.header.has_refs, self.header.inner_bptree) {
            (_, true) => NodeKind::InnerBptree,
            (true, false) => NodeKind::HasRefs,
            (false, false) => NodeKind::Normal,
        }
    }

    /// Owner-defined flag.
    pub fn context_flag(&self) -> bool {
        self.header.context
    }

    /// Allocated bytes including the header.
    pub fn capacity(&self) -> usize {
        self.header.capacity
    }

    /// Bytes in use including the header.
    pub fn byte_size(&self) -> usize {
        self.header.byte_size()
    }

    /// Slot of this node in its parent.
    pub fn ndx_in_parent(&self) -> usize {
        self.ndx_in_parent
    }

    /// Records the slot of this node in its parent.
    pub fn set_ndx_in_parent(&mut self, ndx: usize) {
        self.ndx_in_parent = ndx;
    }

    /// Reads element `ndx`.
    #[inline]
    pub fn get<T: Translate + ?Sized>(&self, alloc: &T, ndx: usize) -> i64 {
        debug_assert!(ndx < self.header.size, "index {ndx} past node size {}", self.header.size);
        width::get(&alloc.translate(self.r)[HEADER_LEN..], self.header.width, ndx)
    }

    /// Reads element `ndx` as a child ref.
    pub fn get_ref<T: Translate + ?Sized>(&self, alloc: &T, ndx: usize) -> Option<Ref> {
        Ref::from_element(self.get(alloc, ndx))
    }

    /// Last element.
    pub fn back<T: Translate + ?Sized>(&self, alloc: &T) -> i64 {
        self.get(alloc, self.header.size - 1)
    }

    /// All elements, decoded.
    pub fn to_vec<T: Translate + ?Sized>(&self, alloc: &T) -> Vec<i64> {
        let mut out = Vec::with_capacity(self.header.size);
        let data = &alloc.translate(self.r)[HEADER_LEN..];
        width::scan(data, self.header.width, 0, self.header.size, |_, v| {
            out.push(v);
            true
        });
        out
    }

    /// Overwrites element `ndx`.
    pub fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> Result<()> {
        debug_assert!(ndx < self.header.size);
        let old = self.get(alloc, ndx);
        if old == value {
            return Ok(());
        }
        let needed = bit_width(value);
        if needed > self.header.width {
            let mut values = self.to_vec(alloc);
            values[ndx] = value;
            return self.repack(alloc, &values, needed);
        }
        self.copy_on_write(alloc)?;
        let w = self.header.width;
        width::set(&mut alloc.translate_mut(self.r)[HEADER_LEN..], w, ndx, value);
        self.shrink_after_removal(alloc, bit_width(old))
    }

    /// Inserts `value` before element `ndx`.
    pub fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> Result<()> {
        let size = self.header.size;
        debug_assert!(ndx <= size);
        let needed = bit_width(value);
        if needed > self.header.width {
            let mut values = self.to_vec(alloc);
            values.insert(ndx, value);
            return self.repack(alloc, &values, needed);
        }
        let w = self.header.width;
        self.reserve(alloc, node::byte_size_for(size + 1, w))?;
        let data = &mut alloc.translate_mut(self.r)[HEADER_LEN..];
        for i in (ndx..size).rev() {
            let v = width::get(data, w, i);
            width::set(data, w, i + 1, v);
        }
        width::set(data, w, ndx, value);
        self.header.size = size + 1;
        self.write_header(alloc);
        Ok(())
    }

    /// Appends `value`.
    pub fn add(&mut self, alloc: &mut SlabAlloc, value: i64) -> Result<()> {
        let size = self.header.size;
        self.insert(alloc, size, value)
    }

    /// Removes element `ndx`, shifting later elements down.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> Result<()> {
        let size = self.header.size;
        debug_assert!(ndx < size);
        let removed = self.get(alloc, ndx);
        self.copy_on_write(alloc)?;
        let w = self.header.width;
        let data = &mut alloc.translate_mut(self.r)[HEADER_LEN..];
        for i in ndx + 1..size {
            let v = width::get(data, w, i);
            width::set(data, w, i - 1, v);
        }
        self.header.size = size - 1;
        self.write_header(alloc);
        self.shrink_after_removal(alloc, bit_width(removed))
    }

    /// Removes elements `begin..end`.
    pub fn erase_range(&mut self, alloc: &mut SlabAlloc, begin: usize, end: usize) -> Result<()> {
        debug_assert!(begin <= end && end <= self.header.size);
        if begin == end {
            return Ok(());
        }
        let mut values = self.to_vec(alloc);
        values.drain(begin..end);
        let w = min_width(&values);
        self.repack(alloc, &values, w)
    }

    /// Drops every element from `new_size` on.
    pub fn truncate(&mut self, alloc: &mut SlabAlloc, new_size: usize) -> Result<()> {
        let size = self.header.size;
        debug_assert!(new_size <= size);
        if new_size == size {
            return Ok(());
        }
        let removed_width = {
            let data = &alloc.translate(self.r)[HEADER_LEN..];
            let mut widest = 0;
            width::scan(data, self.header.width, new_size, size, |_, v| {
                widest = widest.max(bit_width(v));
                true
            });
            widest
        };
        self.copy_on_write(alloc)?;
        self.header.size = new_size;
        self.write_header(alloc);
        self.shrink_after_removal(alloc, removed_width)
    }

    /// Removes every element.
    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.truncate(alloc, 0)
    }

    /// Overwrites element `ndx` with the last element and drops the last slot.
    pub fn move_last_over(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> Result<()> {
        let size = self.header.size;
        debug_assert!(ndx < size);
        let last = size - 1;
        if ndx != last {
            let removed = self.get(alloc, ndx);
            let moved = self.get(alloc, last);
            self.copy_on_write(alloc)?;
            let w = self.header.width;
            width::set(&mut alloc.translate_mut(self.r)[HEADER_LEN..], w, ndx, moved);
            self.header.size = last;
            self.write_header(alloc);
            return self.shrink_after_removal(alloc, bit_width(removed));
        }
        self.truncate(alloc, last)
    }

    /// Adds `delta` to every element in `begin..end`.
    pub fn adjust(
        &mut self,
        alloc: &mut SlabAlloc,
        begin: usize,
        end: usize,
        delta: i64,
    ) -> Result<()> {
        if begin >= end || delta == 0 {
            return Ok(());
        }
        let mut values = self.to_vec(alloc);
        for v in &mut values[begin..end] {
            *v += delta;
        }
        self.assign(alloc, &values)
    }

    /// Adds `delta` to every element `>= limit`; returns how many changed.
    pub fn adjust_ge(&mut self, alloc: &mut SlabAlloc, limit: i64, delta: i64) -> Result<usize> {
        let mut values = self.to_vec(alloc);
        let mut changed = 0;
        for v in values.iter_mut().filter(|v| **v >= limit) {
            *v += delta;
            changed += 1;
        }
        if changed > 0 {
            self.assign(alloc, &values)?;
        }
        Ok(changed)
    }

    /// Replaces the whole content with `values` at their minimal width.
    pub fn assign(&mut self, alloc: &mut SlabAlloc, values: &[i64]) -> Result<()> {
        let w = min_width(values);
        self.repack(alloc, values, w)
    }

    /// Sets or clears the owner-defined header flag.
    pub fn set_context_flag(&mut self, alloc: &mut SlabAlloc, value: bool) -> Result<()> {
        if self.header.context == value {
            return Ok(());
        }
        self.copy_on_write(alloc)?;
        self.header.context = value;
        self.write_header(alloc);
        Ok(())
    }

    /// Index of the first element in `begin..end` satisfying `C` against `target`.
    pub fn find_first<C: Condition, T: Translate + ?Sized>(
        &self,
        alloc: &T,
        target: i64,
        begin: usize,
        end: usize,
    ) -> Option<usize> {
        let end = end.min(self.header.size);
        if begin >= end {
            return None;
        }
        let (lo, hi) = width::width_range(self.header.width);
        if !C::may_match(target, lo, hi) {
            return None;
        }
        let data = &alloc.translate(self.r)[HEADER_LEN..];
        let mut found = None;
        width::scan(data, self.header.width, begin, end, |ndx, v| {
            if C::eval(v, target) {
                found = Some(ndx);
                false
            } else {
                true
            }
        });
        found
    }

    /// Pushes `offset + ndx` for every matching element in `begin..end`.
    pub fn find_all<C: Condition, T: Translate + ?Sized>(
        &self,
        alloc: &T,
        target: i64,
        begin: usize,
        end: usize,
        offset: usize,
        out: &mut Vec<usize>,
    ) {
        let end = end.min(self.header.size);
        if begin >= end {
            return;
        }
        let (lo, hi) = width::width_range(self.header.width);
        if !C::may_match(target, lo, hi) {
            return;
        }
        let data = &alloc.translate(self.r)[HEADER_LEN..];
        width::scan(data, self.header.width, begin, end, |ndx, v| {
            if C::eval(v, target) {
                out.push(offset + ndx);
            }
            true
        });
    }

    /// First index whose element is not less than `value`; elements must be sorted.
    pub fn lower_bound<T: Translate + ?Sized>(&self, alloc: &T, value: i64) -> usize {
        self.partition_point(alloc, |v| v < value)
    }

    /// First index whose element is greater than `value`; elements must be sorted.
    pub fn upper_bound<T: Translate + ?Sized>(&self, alloc: &T, value: i64) -> usize {
        self.partition_point(alloc, |v| v <= value)
    }

    /// First index whose element fails `pred`; `pred` must hold for a prefix.
    pub fn partition_point<T, F>(&self, alloc: &T, pred: F) -> usize
    where
        T: Translate + ?Sized,
        F: Fn(i64) -> bool,
    {
        let data = &alloc.translate(self.r)[HEADER_LEN..];
        let (mut lo, mut hi) = (0, self.header.size);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(width::get(data, self.header.width, mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Makes the node writable, copying it out of the immutable region if needed.
    ///
    /// Returns true when the node moved.
    pub fn copy_on_write(&mut self, alloc: &mut SlabAlloc) -> Result<bool> {
        if !alloc.is_read_only(self.r) {
            return Ok(false);
        }
        let used = self.header.byte_size();
        let new_ref = alloc.realloc(self.r, self.header.capacity, used)?;
        self.r = new_ref;
        self.header.capacity = used;
        self.write_header(alloc);
        Ok(true)
    }

    /// Releases this node only.
    pub fn destroy(self, alloc: &mut SlabAlloc) {
        alloc.free(self.r, self.header.capacity);
    }

    /// Releases this node and, for has-refs nodes, every node reachable from it.
    pub fn destroy_deep(self, alloc: &mut SlabAlloc) {
        if self.header.has_refs {
            for child in self.to_vec(alloc).into_iter().filter_map(Ref::from_element) {
                Array::attach(alloc, child).destroy_deep(alloc);
            }
        }
        self.destroy(alloc);
    }

    /// Releases the subtree at `r`; null refs are ignored.
    pub fn destroy_deep_ref(alloc: &mut SlabAlloc, r: Ref) {
        if !r.is_null() {
            Array::attach(alloc, r).destroy_deep(alloc);
        }
    }

    /// Smallest width able to hold every current element.
    pub fn min_width<T: Translate + ?Sized>(&self, alloc: &T) -> u8 {
        let data = &alloc.translate(self.r)[HEADER_LEN..];
        let mut widest = 0;
        width::scan(data, self.header.width, 0, self.header.size, |_, v| {
            widest = widest.max(bit_width(v));
            widest < 64
        });
        widest
    }

    fn shrink_after_removal(&mut self, alloc: &mut SlabAlloc, removed_width: u8) -> Result<()> {
        if removed_width < self.header.width {
            return Ok(());
        }
        let narrowest = self.min_width(alloc);
        if narrowest < self.header.width {
            let values = self.to_vec(alloc);
            self.repack(alloc, &values, narrowest)?;
        }
        Ok(())
    }

    /// Rebuilds the node from `values` at width `w` into a fresh payload buffer.
    fn repack(&mut self, alloc: &mut SlabAlloc, values: &[i64], w: u8) -> Result<()> {
        let old_width = self.header.width;
        let needed = node::byte_size_for(values.len(), w);
        check_node_limits(values.len(), needed)?;
        self.reserve(alloc, needed)?;
        let payload = width::encode(values, w);
        let dst = alloc.translate_mut(self.r);
        dst[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(&payload);
        self.header.size = values.len();
        self.header.width = w;
        self.write_header(alloc);
        if old_width != w {
            trace!(
                target: "colstore::array",
                r = self.r.0,
                from = old_width,
                to = w,
                size = values.len(),
                "re-packed node"
            );
        }
        Ok(())
    }

    /// Ensures the node is writable and holds at least `needed` bytes.
    fn reserve(&mut self, alloc: &mut SlabAlloc, needed: usize) -> Result<()> {
        if needed <= self.header.capacity && !alloc.is_read_only(self.r) {
            return Ok(());
        }
        if needed <= self.header.capacity {
            self.copy_on_write(alloc)?;
            if needed <= self.header.capacity {
                return Ok(());
            }
        }
        let max = MAX_HEADER_FIELD & !(node::NODE_ALIGN - 1);
        let grown = needed.max(self.header.capacity.saturating_mul(2)).min(max);
        check_node_limits(0, grown.max(needed))?;
        let keep = self.header.byte_size();
        let new_ref = alloc.realloc(self.r, self.header.capacity, grown)?;
        debug_assert!(keep <= grown);
        self.r = new_ref;
        self.header.capacity = grown;
        self.write_header(alloc);
        Ok(())
    }

    fn write_header(&self, alloc: &mut SlabAlloc) {
        self.header.encode(alloc.translate_mut(self.r));
    }
}

/// Serializes a standalone node holding `values` at their minimal width.
///
/// The capacity field equals the returned length.
pub fn encode_node(kind: NodeKind, context: bool, values: &[i64]) -> Vec<u8> {
    let width = min_width(values);
    let byte_size = node::byte_size_for(values.len(), width);
    let (has_refs, inner_bptree) = kind.flags();
    let header = NodeHeader {
        capacity: byte_size,
        size: values.len(),
        width,
        has_refs,
        inner_bptree,
        context,
    };
    let mut out = vec![0u8; byte_size];
    header.encode(&mut out);
    let payload = width::encode(values, width);
    out[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(&payload);
    out
}

/// Smallest width able to hold every value in `values`.
pub fn min_width(values: &[i64]) -> u8 {
    values.iter().map(|v| bit_width(*v)).max().unwrap_or(0)
}

fn check_node_limits(size: usize, byte_size: usize) -> Result<()> {
    if size > MAX_HEADER_FIELD || byte_size > MAX_HEADER_FIELD {
        return Err(StoreError::OutOfMemory {
            requested: byte_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests;

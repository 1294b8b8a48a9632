#![forbid(unsafe_code)]
//! Integer B+-tree over [`Array`] nodes.
//!
//! A tree is identified by its root ref. A root that is not an inner node is
//! the only leaf. Every mutation descends from the root, copies each touched
//! node out of the immutable region on the way back up, and rewrites child
//! slots whose ref changed, so the caller only has to store the new root ref.
//!
//! Overflowing leaves and inner nodes split; the split of the root introduces
//! a new root. Leaves that become empty are unlinked and a root left with a
//! single child collapses into it. Underfull leaves are never merged.

mod inner;

use std::sync::Arc;

use tracing::trace;

use crate::primitives::alloc::{SlabAlloc, Translate};
use crate::storage::array::{Array, Condition, NodeKind};
use crate::storage::stats::TreeStats;
use crate::types::{Ref, Result};

pub(crate) use inner::{inner_elements, InnerNode};

/// Parameters shared by every tree of one group.
#[derive(Clone, Debug)]
pub struct TreeConfig {
    /// Split threshold for leaves (elements) and inner nodes (children).
    pub max_node_size: usize,
    /// Counters updated by structural changes.
    pub stats: Arc<TreeStats>,
}

impl TreeConfig {
    /// Config with the given split threshold and fresh counters.
    pub fn new(max_node_size: usize) -> Self {
        Self {
            max_node_size,
            stats: Arc::new(TreeStats::default()),
        }
    }
}

/// A leaf together with the logical index of its first element.
#[derive(Clone, Copy, Debug)]
pub struct LeafSpan {
    /// The leaf accessor.
    pub leaf: Array,
    /// Logical index of `leaf[0]`.
    pub begin: usize,
}

impl LeafSpan {
    /// One past the logical index of the last element.
    pub fn end(&self) -> usize {
        self.begin + self.leaf.size()
    }

    /// Whether the span covers logical index `ndx`.
    pub fn contains(&self, ndx: usize) -> bool {
        ndx >= self.begin && ndx < self.end()
    }
}

/// Depth and node counts of a tree.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct TreeShape {
    /// Levels, counting the leaf level.
    pub depth: usize,
    /// Leaf nodes.
    pub leaves: usize,
    /// Inner nodes.
    pub inner_nodes: usize,
}

struct Split {
    right: Ref,
    left_size: usize,
    right_size: usize,
}

/// Records copy-on-write and re-pack events of one node operation.
struct NodeTracker {
    r: Ref,
    was_read_only: bool,
    width: u8,
}

impl NodeTracker {
    fn start(alloc: &SlabAlloc, node: &Array) -> Self {
        Self {
            r: node.node_ref(),
            was_read_only: alloc.is_read_only(node.node_ref()),
            width: node.width(),
        }
    }

    fn finish(self, stats: &TreeStats, node: &Array) {
        if self.was_read_only && node.node_ref() != self.r {
            stats.add_cow_copies(1);
        }
        if node.width() != self.width {
            stats.add_repacks(1);
        }
    }
}

/// Root accessor of one B+-tree.
#[derive(Clone, Copy, Debug)]
pub struct BpTree {
    root: Array,
    leaf_has_refs: bool,
}

impl BpTree {
    /// Allocates an empty tree whose leaves hold plain integers, or refs when `has_refs`.
    pub fn create(alloc: &mut SlabAlloc, has_refs: bool) -> Result<BpTree> {
        let root = Array::create_empty(alloc, leaf_kind(has_refs))?;
        Ok(BpTree {
            root,
            leaf_has_refs: has_refs,
        })
    }

    /// Builds a balanced tree holding `values`.
    pub fn from_values(
        alloc: &mut SlabAlloc,
        cfg: &TreeConfig,
        has_refs: bool,
        values: &[i64],
    ) -> Result<BpTree> {
        let root = build_tree(values, has_refs, cfg.max_node_size, |kind, elements| {
            Ok(Array::from_values(alloc, kind, false, elements)?.node_ref())
        })?;
        Ok(BpTree::attach(alloc, root))
    }

    /// Attaches to the tree rooted at `r`.
    pub fn attach<T: Translate + ?Sized>(store: &T, r: Ref) -> BpTree {
        let root = Array::attach(store, r);
        let mut node = root;
        while node.is_inner_bptree_node() {
            let inner = InnerNode::new(node);
            node = Array::attach(store, inner.child_ref(store, 0));
        }
        BpTree {
            root,
            leaf_has_refs: node.has_refs(),
        }
    }

    /// Root ref; changes whenever the root moves.
    pub fn root_ref(&self) -> Ref {
        self.root.node_ref()
    }

    /// The root accessor.
    pub fn root(&self) -> &Array {
        &self.root
    }

    /// Whether leaves store refs.
    pub fn leaf_has_refs(&self) -> bool {
        self.leaf_has_refs
    }

    /// Whether the root is the only leaf.
    pub fn root_is_leaf(&self) -> bool {
        !self.root.is_inner_bptree_node()
    }

    /// Element count.
    pub fn size<T: Translate + ?Sized>(&self, store: &T) -> usize {
        if self.root_is_leaf() {
            self.root.size()
        } else {
            InnerNode::new(self.root).total(store)
        }
    }

    /// Returns true when the tree holds no elements.
    pub fn is_empty<T: Translate + ?Sized>(&self, store: &T) -> bool {
        self.size(store) == 0
    }

    /// Element at `ndx`.
    pub fn get<T: Translate + ?Sized>(&self, store: &T, ndx: usize) -> i64 {
        let span = self.get_bptree_leaf(store, ndx);
        span.leaf.get(store, ndx - span.begin)
    }

    /// The leaf holding logical index `ndx`.
    pub fn get_bptree_leaf<T: Translate + ?Sized>(&self, store: &T, ndx: usize) -> LeafSpan {
        let mut node = self.root;
        let mut begin = 0;
        let mut local = ndx;
        while node.is_inner_bptree_node() {
            let inner = InnerNode::new(node);
            let (child, offset) = inner.find_child(store, local);
            begin += local - offset;
            local = offset;
            node = Array::attach(store, inner.child_ref(store, child));
        }
        LeafSpan { leaf: node, begin }
    }

    /// Visits leaves in order, starting with the one holding `from`, until `f` returns false.
    ///
    /// Returns false when `f` stopped the walk.
    pub fn for_each_leaf<T, F>(&self, store: &T, from: usize, mut f: F) -> bool
    where
        T: Translate + ?Sized,
        F: FnMut(LeafSpan) -> bool,
    {
        visit_leaves(store, self.root, 0, from, &mut f)
    }

    /// Every element, in order.
    pub fn to_vec<T: Translate + ?Sized>(&self, store: &T) -> Vec<i64> {
        let mut out = Vec::with_capacity(self.size(store));
        self.for_each_leaf(store, 0, |span| {
            out.extend(span.leaf.to_vec(store));
            true
        });
        out
    }

    /// First index in `begin..end` whose element satisfies `C` against `value`.
    pub fn find_first<C: Condition, T: Translate + ?Sized>(
        &self,
        store: &T,
        value: i64,
        begin: usize,
        end: usize,
    ) -> Option<usize> {
        if begin >= end {
            return None;
        }
        let mut found = None;
        self.for_each_leaf(store, begin, |span| {
            if span.begin >= end {
                return false;
            }
            let local_begin = begin.saturating_sub(span.begin);
            let local_end = (end - span.begin).min(span.leaf.size());
            match span.leaf.find_first::<C, T>(store, value, local_begin, local_end) {
                Some(i) => {
                    found = Some(span.begin + i);
                    false
                }
                None => true,
            }
        });
        found
    }

    /// Every index in `begin..end` whose element satisfies `C` against `value`.
    pub fn find_all<C: Condition, T: Translate + ?Sized>(
        &self,
        store: &T,
        value: i64,
        begin: usize,
        end: usize,
        out: &mut Vec<usize>,
    ) {
        if begin >= end {
            return;
        }
        self.for_each_leaf(store, begin, |span| {
            if span.begin >= end {
                return false;
            }
            let local_begin = begin.saturating_sub(span.begin);
            let local_end = (end - span.begin).min(span.leaf.size());
            span.leaf
                .find_all::<C, T>(store, value, local_begin, local_end, span.begin, out);
            true
        });
    }

    /// First index whose element is not less than `value`; elements must be sorted.
    pub fn lower_bound<T: Translate + ?Sized>(&self, store: &T, value: i64) -> usize {
        self.partition_point(store, |v| v < value)
    }

    /// First index whose element is greater than `value`; elements must be sorted.
    pub fn upper_bound<T: Translate + ?Sized>(&self, store: &T, value: i64) -> usize {
        self.partition_point(store, |v| v <= value)
    }

    /// One root-to-leaf descent: each inner node bisects its children on
    /// their first elements, then the chosen leaf is bisected in place.
    fn partition_point<T, F>(&self, store: &T, pred: F) -> usize
    where
        T: Translate + ?Sized,
        F: Fn(i64) -> bool,
    {
        let mut node = self.root;
        let mut begin = 0;
        while node.is_inner_bptree_node() {
            let inner = InnerNode::new(node);
            // Child 0 is entered whenever no later child starts inside the prefix.
            let (mut lo, mut hi) = (1, inner.child_count());
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if pred(first_element(store, inner.child_ref(store, mid))) {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            let child = lo - 1;
            begin += inner.child_start(store, child);
            node = Array::attach(store, inner.child_ref(store, child));
        }
        begin + node.partition_point(store, &pred)
    }

    /// Depth and node counts.
    pub fn shape<T: Translate + ?Sized>(&self, store: &T) -> TreeShape {
        let mut shape = TreeShape::default();
        measure(store, self.root, 1, &mut shape);
        shape
    }

    /// Overwrites the element at `ndx`.
    pub fn set(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, ndx: usize, value: i64) -> Result<()> {
        set_rec(alloc, cfg, &mut self.root, ndx, value)
    }

    /// Inserts `value` before `ndx`; `ndx == size` appends.
    pub fn insert(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, ndx: usize, value: i64) -> Result<()> {
        debug_assert!(ndx <= self.size(alloc));
        if let Some(split) = insert_rec(alloc, cfg, &mut self.root, ndx, value)? {
            self.introduce_new_root(alloc, cfg, split)?;
        }
        Ok(())
    }

    /// Appends `value`.
    pub fn add(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, value: i64) -> Result<()> {
        let size = self.size(alloc);
        self.insert(alloc, cfg, size, value)
    }

    /// Removes the element at `ndx` and returns it.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, ndx: usize) -> Result<i64> {
        debug_assert!(ndx < self.size(alloc));
        let removed = erase_rec(alloc, cfg, &mut self.root, ndx)?;
        self.collapse_root(alloc, cfg)?;
        Ok(removed)
    }

    /// Moves the last element into `ndx` and drops the last slot; returns the old value at `ndx`.
    pub fn move_last_over(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, ndx: usize) -> Result<i64> {
        let last = self.size(alloc) - 1;
        let removed = self.get(alloc, ndx);
        if ndx != last {
            let moved = self.get(alloc, last);
            self.set(alloc, cfg, ndx, moved)?;
        }
        self.erase(alloc, cfg, last)?;
        Ok(removed)
    }

    /// Adds `delta` to every element `>= limit`.
    pub fn adjust_ge(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, limit: i64, delta: i64) -> Result<()> {
        update_leaves(alloc, cfg, &mut self.root, &mut |alloc, leaf| {
            leaf.adjust_ge(alloc, limit, delta).map(|_| ())
        })
    }

    /// Removes every element, keeping an empty root leaf.
    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        let old = self.root;
        let ndx = old.ndx_in_parent();
        old.destroy_deep(alloc);
        self.root = Array::create_empty(alloc, leaf_kind(self.leaf_has_refs))?;
        self.root.set_ndx_in_parent(ndx);
        Ok(())
    }

    /// Releases every node of the tree.
    pub fn destroy(self, alloc: &mut SlabAlloc) {
        self.root.destroy_deep(alloc);
    }

    fn introduce_new_root(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig, split: Split) -> Result<()> {
        let ndx = self.root.ndx_in_parent();
        let left = self.root.node_ref();
        let mut root = InnerNode::build(
            alloc,
            &[(left, split.left_size), (split.right, split.right_size)],
        )?
        .arr;
        root.set_ndx_in_parent(ndx);
        cfg.stats.inc_new_roots();
        trace!(
            target: "colstore::bptree",
            left = left.0,
            right = split.right.0,
            root = root.node_ref().0,
            "introduced new root"
        );
        self.root = root;
        Ok(())
    }

    fn collapse_root(&mut self, alloc: &mut SlabAlloc, cfg: &TreeConfig) -> Result<()> {
        let ndx = self.root.ndx_in_parent();
        while self.root.is_inner_bptree_node() {
            let inner = InnerNode::new(self.root);
            match inner.child_count() {
                0 => {
                    self.root.destroy_deep(alloc);
                    self.root = Array::create_empty(alloc, leaf_kind(self.leaf_has_refs))?;
                }
                1 => {
                    let child = inner.child_ref(alloc, 0);
                    inner.destroy_shallow(alloc);
                    self.root = Array::attach(alloc, child);
                    cfg.stats.inc_root_collapses();
                    trace!(target: "colstore::bptree", root = child.0, "collapsed single-child root");
                }
                _ => break,
            }
        }
        self.root.set_ndx_in_parent(ndx);
        Ok(())
    }
}

fn leaf_kind(has_refs: bool) -> NodeKind {
    if has_refs {
        NodeKind::HasRefs
    } else {
        NodeKind::Normal
    }
}

fn is_empty_subtree(node: &Array) -> bool {
    if node.is_inner_bptree_node() {
        InnerNode::new(*node).child_count() == 0
    } else {
        node.is_empty()
    }
}

fn visit_leaves<T, F>(store: &T, node: Array, base: usize, from: usize, f: &mut F) -> bool
where
    T: Translate + ?Sized,
    F: FnMut(LeafSpan) -> bool,
{
    if !node.is_inner_bptree_node() {
        return f(LeafSpan { leaf: node, begin: base });
    }
    let inner = InnerNode::new(node);
    let mut start = base;
    for (i, size) in inner.child_sizes(store).into_iter().enumerate() {
        let end = start + size;
        if end > from || (size == 0 && start >= from) {
            let child = Array::attach(store, inner.child_ref(store, i));
            if !visit_leaves(store, child, start, from, f) {
                return false;
            }
        }
        start = end;
    }
    true
}

/// First element of the subtree at `r`; non-root leaves are never empty.
fn first_element<T: Translate + ?Sized>(store: &T, r: Ref) -> i64 {
    let mut node = Array::attach(store, r);
    while node.is_inner_bptree_node() {
        node = Array::attach(store, InnerNode::new(node).child_ref(store, 0));
    }
    debug_assert!(!node.is_empty(), "empty non-root leaf {}", node.node_ref());
    node.get(store, 0)
}

fn measure<T: Translate + ?Sized>(store: &T, node: Array, level: usize, shape: &mut TreeShape) {
    shape.depth = shape.depth.max(level);
    if !node.is_inner_bptree_node() {
        shape.leaves += 1;
        return;
    }
    shape.inner_nodes += 1;
    let inner = InnerNode::new(node);
    for i in 0..inner.child_count() {
        measure(store, Array::attach(store, inner.child_ref(store, i)), level + 1, shape);
    }
}

fn set_rec(alloc: &mut SlabAlloc, cfg: &TreeConfig, node: &mut Array, ndx: usize, value: i64) -> Result<()> {
    let tracker = NodeTracker::start(alloc, node);
    if !node.is_inner_bptree_node() {
        node.set(alloc, ndx, value)?;
        tracker.finish(&cfg.stats, node);
        return Ok(());
    }
    let mut inner = InnerNode::new(*node);
    let (i, offset) = inner.find_child(alloc, ndx);
    let mut child = Array::attach(alloc, inner.child_ref(alloc, i));
    set_rec(alloc, cfg, &mut child, offset, value)?;
    inner.set_child(alloc, i, child.node_ref())?;
    *node = inner.arr;
    tracker.finish(&cfg.stats, node);
    Ok(())
}

fn insert_rec(
    alloc: &mut SlabAlloc,
    cfg: &TreeConfig,
    node: &mut Array,
    ndx: usize,
    value: i64,
) -> Result<Option<Split>> {
    if !node.is_inner_bptree_node() {
        return leaf_insert(alloc, cfg, node, ndx, value);
    }
    let tracker = NodeTracker::start(alloc, node);
    let mut inner = InnerNode::new(*node);
    let (i, offset) = inner.find_child(alloc, ndx);
    let mut child = Array::attach(alloc, inner.child_ref(alloc, i));
    let split = insert_rec(alloc, cfg, &mut child, offset, value)?;
    inner.set_child(alloc, i, child.node_ref())?;
    match split {
        None => inner.adjust(alloc, i, 1)?,
        Some(split) => {
            inner.split_child(alloc, i, split.left_size, split.right, split.right_size)?;
        }
    }
    *node = inner.arr;
    tracker.finish(&cfg.stats, node);
    if inner.child_count() <= cfg.max_node_size {
        return Ok(None);
    }
    split_inner(alloc, cfg, node, i + 1)
}

fn leaf_insert(
    alloc: &mut SlabAlloc,
    cfg: &TreeConfig,
    leaf: &mut Array,
    ndx: usize,
    value: i64,
) -> Result<Option<Split>> {
    let tracker = NodeTracker::start(alloc, leaf);
    let size = leaf.size();
    if size < cfg.max_node_size {
        leaf.insert(alloc, ndx, value)?;
        tracker.finish(&cfg.stats, leaf);
        return Ok(None);
    }
    let kind = leaf_kind(leaf.has_refs());
    let right = if ndx == size {
        Array::from_values(alloc, kind, false, &[value])?
    } else {
        let values = leaf.to_vec(alloc);
        let mid = size / 2;
        let mut right = Array::from_values(alloc, kind, false, &values[mid..])?;
        leaf.truncate(alloc, mid)?;
        if ndx <= mid {
            leaf.insert(alloc, ndx, value)?;
        } else {
            right.insert(alloc, ndx - mid, value)?;
        }
        right
    };
    tracker.finish(&cfg.stats, leaf);
    cfg.stats.inc_leaf_splits();
    trace!(
        target: "colstore::bptree",
        left = leaf.node_ref().0,
        right = right.node_ref().0,
        left_size = leaf.size(),
        right_size = right.size(),
        "split leaf"
    );
    Ok(Some(Split {
        right: right.node_ref(),
        left_size: leaf.size(),
        right_size: right.size(),
    }))
}

/// Splits an overfull inner node; `new_child` is the slot that was just added.
fn split_inner(
    alloc: &mut SlabAlloc,
    cfg: &TreeConfig,
    node: &mut Array,
    new_child: usize,
) -> Result<Option<Split>> {
    let inner = InnerNode::new(*node);
    let children = inner.children(alloc);
    let k = children.len();
    let at = if new_child == k - 1 { k - 1 } else { k / 2 };
    let ndx = node.ndx_in_parent();
    let left = InnerNode::build(alloc, &children[..at])?;
    let right = InnerNode::build(alloc, &children[at..])?;
    inner.destroy_shallow(alloc);
    *node = left.arr;
    node.set_ndx_in_parent(ndx);
    cfg.stats.inc_inner_splits();
    trace!(
        target: "colstore::bptree",
        left = left.arr.node_ref().0,
        right = right.arr.node_ref().0,
        at,
        "split inner node"
    );
    Ok(Some(Split {
        right: right.arr.node_ref(),
        left_size: left.total(alloc),
        right_size: right.total(alloc),
    }))
}

fn erase_rec(alloc: &mut SlabAlloc, cfg: &TreeConfig, node: &mut Array, ndx: usize) -> Result<i64> {
    let tracker = NodeTracker::start(alloc, node);
    if !node.is_inner_bptree_node() {
        let removed = node.get(alloc, ndx);
        node.erase(alloc, ndx)?;
        tracker.finish(&cfg.stats, node);
        return Ok(removed);
    }
    let mut inner = InnerNode::new(*node);
    let (i, offset) = inner.find_child(alloc, ndx);
    let mut child = Array::attach(alloc, inner.child_ref(alloc, i));
    let removed = erase_rec(alloc, cfg, &mut child, offset)?;
    if is_empty_subtree(&child) {
        inner.remove_child(alloc, i)?;
        child.destroy_deep(alloc);
        cfg.stats.inc_leaf_removals();
        trace!(target: "colstore::bptree", child = i, "removed empty child");
    } else {
        inner.set_child(alloc, i, child.node_ref())?;
        inner.adjust(alloc, i, -1)?;
    }
    *node = inner.arr;
    tracker.finish(&cfg.stats, node);
    Ok(removed)
}

fn update_leaves<F>(alloc: &mut SlabAlloc, cfg: &TreeConfig, node: &mut Array, f: &mut F) -> Result<()>
where
    F: FnMut(&mut SlabAlloc, &mut Array) -> Result<()>,
{
    let tracker = NodeTracker::start(alloc, node);
    if !node.is_inner_bptree_node() {
        f(alloc, node)?;
        tracker.finish(&cfg.stats, node);
        return Ok(());
    }
    let mut inner = InnerNode::new(*node);
    for i in 0..inner.child_count() {
        let mut child = Array::attach(alloc, inner.child_ref(alloc, i));
        update_leaves(alloc, cfg, &mut child, f)?;
        inner.set_child(alloc, i, child.node_ref())?;
    }
    *node = inner.arr;
    tracker.finish(&cfg.stats, node);
    Ok(())
}

/// Builds a tree bottom-up from `values`, creating nodes through `make`.
///
/// Leaves are filled to `max_node_size`; each inner level groups up to
/// `max_node_size` children. Returns the root ref.
pub(crate) fn build_tree<F>(values: &[i64], has_refs: bool, max_node_size: usize, mut make: F) -> Result<Ref>
where
    F: FnMut(NodeKind, &[i64]) -> Result<Ref>,
{
    let kind = leaf_kind(has_refs);
    if values.len() <= max_node_size {
        return make(kind, values);
    }
    let mut level = Vec::with_capacity(values.len().div_ceil(max_node_size));
    for chunk in values.chunks(max_node_size) {
        level.push((make(kind, chunk)?, chunk.len()));
    }
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(max_node_size));
        for group in level.chunks(max_node_size) {
            let elements = inner_elements(group, |cumulative| make(NodeKind::Normal, cumulative))?;
            let total: usize = group.iter().map(|(_, s)| s).sum();
            next.push((make(NodeKind::InnerBptree, &elements)?, total));
        }
        level = next;
    }
    Ok(level[0].0)
}

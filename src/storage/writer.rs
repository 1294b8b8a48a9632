#![forbid(unsafe_code)]
//! Serializing node trees into a contiguous image.
//!
//! Commit and whole-file writes go through [`write_deep`], which re-encodes
//! every node it visits at minimal width and rewrites child refs to where
//! the children landed. With `only_if_modified` set, any subtree rooted below
//! the baseline is reused as is: copy-on-write guarantees an untouched root
//! has no touched descendants.

use crate::primitives::alloc::Translate;
use crate::storage::array::{encode_node, Array};
use crate::types::{Ref, Result, StoreError};

/// Destination for serialized nodes.
pub trait ArrayWriter {
    /// Appends one encoded node and returns the ref it will be reachable at.
    fn write_array(&mut self, bytes: &[u8]) -> Result<Ref>;
}

/// Collects nodes into a buffer that will be placed at `base` in an image.
#[derive(Debug)]
pub struct ImageWriter {
    base: u64,
    buf: Vec<u8>,
}

impl ImageWriter {
    /// A writer whose first node lands at `base`.
    pub fn new(base: u64) -> Self {
        debug_assert_eq!(base % 8, 0);
        Self {
            base,
            buf: Vec::new(),
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true when nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Ref of the next node written.
    pub fn next_ref(&self) -> Ref {
        Ref(self.base + self.buf.len() as u64)
    }

    /// The written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl ArrayWriter for ImageWriter {
    fn write_array(&mut self, bytes: &[u8]) -> Result<Ref> {
        if bytes.len() % 8 != 0 {
            return Err(StoreError::Corruption("unaligned node length"));
        }
        let r = self.next_ref();
        self.buf.extend_from_slice(bytes);
        Ok(r)
    }
}

/// Writes the tree rooted at `r` and returns the ref of its copy.
pub fn write_deep<T: Translate + ?Sized>(
    store: &T,
    r: Ref,
    only_if_modified: bool,
    out: &mut dyn ArrayWriter,
) -> Result<Ref> {
    if only_if_modified && store.is_read_only(r) {
        return Ok(r);
    }
    let node = Array::attach(store, r);
    let mut values = node.to_vec(store);
    if node.has_refs() {
        for value in values.iter_mut() {
            if let Some(child) = Ref::from_element(*value) {
                *value = write_deep(store, child, only_if_modified, out)?.to_element();
            }
        }
    }
    out.write_array(&encode_node(node.kind(), node.context_flag(), &values))
}

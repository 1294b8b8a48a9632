#![forbid(unsafe_code)]
//! Ref translation and the slab allocator.
//!
//! Storage is split at the *baseline*. Refs below it resolve into the
//! [`Image`], the immutable bytes of the last committed version, which may be
//! shared with any number of readers. Refs at or above it resolve into slabs
//! owned by the current writer. Nothing below the baseline is ever written:
//! mutating such a node means copying it into slab space first.

mod freelist;

use std::sync::Arc;

use tracing::trace;

use crate::types::{node, Ref, Result, StoreError};

pub use freelist::{Chunk, FreeList};

/// Resolves refs to the bytes they name.
pub trait Translate {
    /// Returns the bytes starting at `r` through the end of its region.
    ///
    /// Panics if `r` was never allocated; open-time verification ensures every
    /// reachable ref is valid.
    fn translate(&self, r: Ref) -> &[u8];

    /// True when `r` lies in immutable, possibly shared, storage.
    fn is_read_only(&self, r: Ref) -> bool;
}

#[derive(Clone, Debug)]
struct Segment {
    start: u64,
    bytes: Arc<[u8]>,
}

/// Immutable storage of committed versions.
///
/// The image is a list of append-only segments. Committing appends a segment
/// and produces a new `Image` sharing the old ones, so readers holding the
/// previous image keep seeing exactly the bytes they started with.
#[derive(Clone, Debug)]
pub struct Image {
    segments: Vec<Segment>,
    len: u64,
}

impl Image {
    /// An image holding only `prefix` zero bytes that no ref may name.
    pub fn with_reserved_prefix(prefix: usize) -> Self {
        Self::from_bytes(vec![0u8; node::align(prefix)].into())
    }

    /// An image over the full contents of a database file.
    pub fn from_bytes(bytes: Arc<[u8]>) -> Self {
        let len = bytes.len() as u64;
        Self {
            segments: vec![Segment { start: 0, bytes }],
            len,
        }
    }

    /// Total bytes covered; also the baseline of a writer on top of this image.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true when the image covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A new image with `bytes` appended at [`len`](Self::len).
    pub fn append(&self, bytes: Vec<u8>) -> Self {
        debug_assert_eq!(bytes.len() % node::NODE_ALIGN, 0);
        let mut segments = self.segments.clone();
        let start = self.len;
        let len = start + bytes.len() as u64;
        if !bytes.is_empty() {
            segments.push(Segment {
                start,
                bytes: bytes.into(),
            });
        }
        Self { segments, len }
    }

    /// Segment contents in ref order.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(|s| &s.bytes[..])
    }

    /// Copies the whole image into one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len as usize);
        for segment in self.segments() {
            out.extend_from_slice(segment);
        }
        out
    }

    /// Returns the bytes at `r`, or `None` when `r` is outside the image.
    pub fn try_translate(&self, r: Ref) -> Option<&[u8]> {
        if r.0 >= self.len {
            return None;
        }
        let idx = self.segments.partition_point(|s| s.start <= r.0);
        let segment = &self.segments[idx.checked_sub(1)?];
        segment.bytes.get((r.0 - segment.start) as usize..)
    }
}

impl Translate for Image {
    fn translate(&self, r: Ref) -> &[u8] {
        self.try_translate(r)
            .unwrap_or_else(|| panic!("ref {r} outside immutable image of {} bytes", self.len))
    }

    fn is_read_only(&self, _r: Ref) -> bool {
        true
    }
}

/// Limits applied by [`SlabAlloc`].
#[derive(Clone, Debug)]
pub struct AllocOptions {
    /// Size of the first slab; later slabs double up to [`MAX_SLAB_SIZE`].
    pub initial_slab_size: usize,
    /// Cap on the total bytes of slab memory.
    pub memory_limit: Option<usize>,
    /// Refs must stay below this value.
    pub max_ref: u64,
}

/// Upper bound for the size of a single slab.
pub const MAX_SLAB_SIZE: usize = 16 << 20;

impl Default for AllocOptions {
    fn default() -> Self {
        Self {
            initial_slab_size: 64 << 10,
            memory_limit: None,
            max_ref: 1 << 48,
        }
    }
}

#[derive(Debug)]
struct Slab {
    ref_end: u64,
    data: Vec<u8>,
}

impl Slab {
    fn ref_start(&self) -> u64 {
        self.ref_end - self.data.len() as u64
    }
}

/// Point-in-time allocator counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct AllocStats {
    /// First mutable ref.
    pub baseline: u64,
    /// Number of slabs.
    pub slabs: usize,
    /// Bytes held by slabs.
    pub slab_bytes: u64,
    /// Chunks on the mutable free list.
    pub free_chunks: usize,
    /// Bytes on the mutable free list.
    pub free_bytes: u64,
    /// Immutable bytes released by copy-on-write or free since the last commit.
    pub read_only_released_bytes: u64,
    /// Mutable bytes currently handed out.
    pub live_bytes: u64,
}

/// The writer's allocator.
///
/// Owns the mutable slabs of one write transaction on top of a shared,
/// immutable [`Image`].
#[derive(Debug)]
pub struct SlabAlloc {
    image: Arc<Image>,
    baseline: u64,
    slabs: Vec<Slab>,
    free_space: FreeList,
    free_read_only: Vec<Chunk>,
    live_bytes: u64,
    options: AllocOptions,
}

impl SlabAlloc {
    /// Creates an allocator whose immutable region is `image`.
    pub fn new(image: Arc<Image>, options: AllocOptions) -> Self {
        let baseline = image.len();
        Self {
            image,
            baseline,
            slabs: Vec::new(),
            free_space: FreeList::default(),
            free_read_only: Vec::new(),
            live_bytes: 0,
            options,
        }
    }

    /// Boundary between immutable and mutable refs.
    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// The immutable image; cloning the `Arc` pins the committed bytes.
    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    /// Returns a fresh, zeroed, mutable chunk of at least `size` bytes.
    pub fn alloc(&mut self, size: usize) -> Result<Ref> {
        debug_assert!(size > 0);
        let size = node::align(size) as u64;
        if let Some(start) = self.free_space.take_first_fit(size) {
            self.live_bytes += size;
            let r = Ref(start);
            self.translate_mut(r)[..size as usize].fill(0);
            trace!(target: "colstore::alloc", r = start, size, "reused free chunk");
            return Ok(r);
        }
        let start = self
            .slabs
            .last()
            .map(|s| s.ref_end)
            .unwrap_or(self.baseline);
        let mut slab_size = self.next_slab_size().max(size as usize);
        if let Some(limit) = self.options.memory_limit {
            let used = self.slab_bytes() as usize;
            let remaining = limit.saturating_sub(used);
            if remaining < size as usize {
                return Err(StoreError::OutOfMemory {
                    requested: size as usize,
                });
            }
            let aligned_remaining = remaining & !(node::NODE_ALIGN - 1);
            slab_size = slab_size.min(aligned_remaining).max(size as usize);
        }
        let end = start
            .checked_add(slab_size as u64)
            .filter(|end| *end <= self.options.max_ref)
            .ok_or(StoreError::AddressSpaceExhausted)?;
        let mut data = Vec::new();
        data.try_reserve_exact(slab_size)
            .map_err(|_| StoreError::OutOfMemory {
                requested: size as usize,
            })?;
        data.resize(slab_size, 0);
        self.slabs.push(Slab { ref_end: end, data });
        self.free_space.add_fence(start);
        self.free_space.add_fence(end);
        if slab_size as u64 > size {
            self.free_space
                .release(Chunk::new(start + size, slab_size as u64 - size));
        }
        self.live_bytes += size;
        trace!(
            target: "colstore::alloc",
            r = start,
            size,
            slab_size,
            slabs = self.slabs.len(),
            "allocated from new slab"
        );
        Ok(Ref(start))
    }

    /// Moves the node at `r` into a chunk of `new_size` bytes.
    ///
    /// The prefix of `min(old_size, new_size)` bytes is preserved. Refs below
    /// the baseline are never reused: their bytes stay intact for readers and
    /// the returned ref always differs.
    pub fn realloc(&mut self, r: Ref, old_size: usize, new_size: usize) -> Result<Ref> {
        let new_ref = self.alloc(new_size)?;
        let keep = old_size.min(new_size);
        let prefix = self.translate(r)[..keep].to_vec();
        self.translate_mut(new_ref)[..keep].copy_from_slice(&prefix);
        if self.is_read_only(r) {
            trace!(target: "colstore::alloc", from = r.0, to = new_ref.0, "copy-on-write");
        }
        self.free(r, old_size);
        Ok(new_ref)
    }

    /// Releases a chunk.
    ///
    /// Immutable chunks are only accounted for; their bytes belong to readers
    /// of the committed version and outlive the call.
    pub fn free(&mut self, r: Ref, size: usize) {
        let size = node::align(size) as u64;
        if self.is_read_only(r) {
            self.free_read_only.push(Chunk::new(r.0, size));
            return;
        }
        self.live_bytes -= size;
        self.free_space.release(Chunk::new(r.0, size));
    }

    /// Mutable bytes starting at `r`.
    ///
    /// Panics when `r` is below the baseline: callers must copy-on-write first.
    pub fn translate_mut(&mut self, r: Ref) -> &mut [u8] {
        assert!(
            r.0 >= self.baseline,
            "write to read-only ref {r} (baseline {})",
            self.baseline
        );
        let idx = self.slab_index(r);
        let slab = &mut self.slabs[idx];
        let offset = (r.0 - slab.ref_start()) as usize;
        &mut slab.data[offset..]
    }

    /// Makes `image` the new immutable region and drops all mutable state.
    ///
    /// Called after a commit has copied every live mutable node into `image`.
    pub fn advance_baseline(&mut self, image: Arc<Image>) {
        debug_assert!(image.len() >= self.image.len());
        trace!(
            target: "colstore::alloc",
            old = self.baseline,
            new = image.len(),
            "advancing baseline"
        );
        self.image = image;
        self.discard_mutable();
    }

    /// Drops every slab and free chunk, returning to the committed image.
    pub fn reset(&mut self) {
        self.discard_mutable();
    }

    fn discard_mutable(&mut self) {
        self.baseline = self.image.len();
        self.slabs.clear();
        self.free_space.clear();
        self.free_read_only.clear();
        self.live_bytes = 0;
    }

    /// Current counters.
    pub fn stats(&self) -> AllocStats {
        AllocStats {
            baseline: self.baseline,
            slabs: self.slabs.len(),
            slab_bytes: self.slab_bytes(),
            free_chunks: self.free_space.chunks().len(),
            free_bytes: self.free_space.free_bytes(),
            read_only_released_bytes: self.free_read_only.iter().map(|c| c.size).sum(),
            live_bytes: self.live_bytes,
        }
    }

    fn slab_bytes(&self) -> u64 {
        self.slabs.iter().map(|s| s.data.len() as u64).sum()
    }

    fn next_slab_size(&self) -> usize {
        let shift = self.slabs.len().min(16) as u32;
        self.options
            .initial_slab_size
            .saturating_mul(1usize << shift)
            .min(MAX_SLAB_SIZE)
            .max(node::NODE_ALIGN)
    }

    fn slab_index(&self, r: Ref) -> usize {
        let idx = self.slabs.partition_point(|s| s.ref_end <= r.0);
        if idx >= self.slabs.len() || r.0 < self.slabs[idx].ref_start() {
            panic!("ref {r} is not inside any slab");
        }
        idx
    }
}

impl Translate for SlabAlloc {
    fn translate(&self, r: Ref) -> &[u8] {
        if r.0 < self.baseline {
            return self.image.translate(r);
        }
        let slab = &self.slabs[self.slab_index(r)];
        &slab.data[(r.0 - slab.ref_start()) as usize..]
    }

    fn is_read_only(&self, r: Ref) -> bool {
        r.0 < self.baseline
    }
}

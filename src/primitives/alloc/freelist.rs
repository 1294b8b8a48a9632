/// A contiguous run of mutable ref space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Chunk {
    /// First ref covered by the chunk.
    pub start: u64,
    /// Length in bytes.
    pub size: u64,
}

impl Chunk {
    /// Creates a chunk covering `start..start + size`.
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    fn end(&self) -> u64 {
        self.start + self.size
    }

}

/// Address-ordered free list with first-fit reuse.
///
/// Adjacent chunks are merged on release unless a fence separates them.
/// Fences mark slab ends: a chunk never spans two slabs, so every chunk the
/// list hands out is backed by one contiguous buffer.
#[derive(Clone, Default, Debug)]
pub struct FreeList {
    chunks: Vec<Chunk>,
    fences: Vec<u64>,
}

impl FreeList {
    /// Chunks currently on the list, ordered by address.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Forbids merging chunks across `at`.
    pub fn add_fence(&mut self, at: u64) {
        let pos = self.fences.partition_point(|f| *f < at);
        if self.fences.get(pos) != Some(&at) {
            self.fences.insert(pos, at);
        }
    }

    fn is_fence(&self, at: u64) -> bool {
        self.fences.binary_search(&at).is_ok()
    }

    /// Merges `chunks[pos + 1]` into `chunks[pos]` when they touch.
    fn coalesce_at(&mut self, pos: usize) -> bool {
        let (left, right) = (self.chunks[pos], self.chunks[pos + 1]);
        if left.end() != right.start || self.is_fence(left.end()) {
            return false;
        }
        self.chunks[pos].size += right.size;
        self.chunks.remove(pos + 1);
        true
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    /// Takes `size` bytes from the lowest-addressed chunk large enough.
    pub fn take_first_fit(&mut self, size: u64) -> Option<u64> {
        let pos = self.chunks.iter().position(|c| c.size >= size)?;
        let chunk = &mut self.chunks[pos];
        let start = chunk.start;
        if chunk.size == size {
            self.chunks.remove(pos);
        } else {
            chunk.start += size;
            chunk.size -= size;
        }
        Some(start)
    }

    /// Returns a chunk to the list, merging it with its neighbours.
    pub fn release(&mut self, chunk: Chunk) {
        debug_assert!(chunk.size > 0);
        let pos = self.chunks.partition_point(|c| c.start < chunk.start);
        debug_assert!(
            pos == self.chunks.len() || chunk.end() <= self.chunks[pos].start,
            "double free of chunk at {}",
            chunk.start
        );
        self.chunks.insert(pos, chunk);
        if pos + 1 < self.chunks.len() {
            self.coalesce_at(pos);
        }
        if pos > 0 {
            self.coalesce_at(pos - 1);
        }
    }

    /// Drops every chunk and fence.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.fences.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_coalesces_both_neighbours() {
        let mut list = FreeList::default();
        list.release(Chunk::new(64, 16));
        list.release(Chunk::new(96, 32));
        list.release(Chunk::new(80, 16));
        assert_eq!(list.chunks(), &[Chunk::new(64, 64)]);
    }

    #[test]
    fn fences_keep_chunks_apart() {
        let mut list = FreeList::default();
        list.add_fence(128);
        list.release(Chunk::new(96, 32));
        list.release(Chunk::new(128, 64));
        list.release(Chunk::new(64, 32));
        assert_eq!(list.chunks(), &[Chunk::new(64, 64), Chunk::new(128, 64)]);
        assert_eq!(list.take_first_fit(96), None);
        list.clear();
        list.release(Chunk::new(96, 32));
        list.release(Chunk::new(128, 64));
        assert_eq!(list.chunks(), &[Chunk::new(96, 96)]);
    }

    #[test]
    fn first_fit_prefers_lowest_address() {
        let mut list = FreeList::default();
        list.release(Chunk::new(512, 64));
        list.release(Chunk::new(128, 16));
        list.release(Chunk::new(256, 64));
        assert_eq!(list.take_first_fit(32), Some(256));
        assert_eq!(list.take_first_fit(16), Some(128));
        assert_eq!(list.chunks(), &[Chunk::new(288, 32), Chunk::new(512, 64)]);
        assert_eq!(list.take_first_fit(128), None);
    }
}

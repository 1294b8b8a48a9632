use crate::primitives::alloc::AllocOptions;

/// Smallest accepted split threshold; a node must hold at least two children.
pub const MIN_NODE_SIZE: usize = 4;

/// Default split threshold for leaves and inner nodes.
pub const DEFAULT_MAX_NODE_SIZE: usize = 1000;

/// Configuration options supplied when creating or opening a [`super::Group`].
#[derive(Clone, Debug)]
pub struct DbOptions {
    /// Maximum elements in a leaf, and children in an inner node, before it splits
    pub max_node_size: usize,
    /// Size of the first slab; later slabs double
    pub initial_slab_size: usize,
    /// Cap on the bytes of mutable slab memory
    pub memory_limit: Option<usize>,
    /// Upper bound of the ref address space
    pub max_ref: u64,
    /// Whether file-backed commits fsync before and after the header flip
    pub sync_on_commit: bool,
    /// Whether opening runs a full structural walk
    pub verify_on_open: bool,
}

impl Default for DbOptions {
    fn default() -> Self {
        let alloc = AllocOptions::default();
        Self {
            max_node_size: DEFAULT_MAX_NODE_SIZE,
            initial_slab_size: alloc.initial_slab_size,
            memory_limit: alloc.memory_limit,
            max_ref: alloc.max_ref,
            sync_on_commit: true,
            verify_on_open: true,
        }
    }
}

impl DbOptions {
    /// Sets the split threshold; values below [`MIN_NODE_SIZE`] are raised to it.
    pub fn max_node_size(mut self, max: usize) -> Self {
        self.max_node_size = max.max(MIN_NODE_SIZE);
        self
    }

    /// Sets the size of the first slab.
    pub fn initial_slab_size(mut self, bytes: usize) -> Self {
        self.initial_slab_size = bytes;
        self
    }

    /// Caps mutable memory.
    pub fn memory_limit(mut self, bytes: Option<usize>) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Sets the upper bound of the ref address space.
    pub fn max_ref(mut self, max: u64) -> Self {
        self.max_ref = max;
        self
    }

    /// Enables or disables fsync on commit.
    pub fn sync_on_commit(mut self, enabled: bool) -> Self {
        self.sync_on_commit = enabled;
        self
    }

    /// Enables or disables verification when opening.
    pub fn verify_on_open(mut self, enabled: bool) -> Self {
        self.verify_on_open = enabled;
        self
    }

    pub(crate) fn alloc_options(&self) -> AllocOptions {
        AllocOptions {
            initial_slab_size: self.initial_slab_size,
            memory_limit: self.memory_limit,
            max_ref: self.max_ref,
        }
    }
}

#![forbid(unsafe_code)]
//! Shared identifiers, error types and the persisted node header format.

use std::fmt;

/// Checksum helpers for the database file header.
pub mod checksum;

pub use checksum::header_crc32;

/// Logical address of a node.
///
/// A `Ref` is never a pointer: it is resolved to bytes through a
/// [`Translate`](crate::primitives::alloc::Translate) capability. `Ref(0)` is
/// reserved as null.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Ref(pub u64);

impl Ref {
    /// The null ref.
    pub const NULL: Ref = Ref(0);

    /// Returns true for the null ref.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Interprets a stored element as a ref.
    ///
    /// Odd values are tagged integers and zero is null; both map to `None`.
    pub fn from_element(value: i64) -> Option<Ref> {
        if value == 0 || value & 1 != 0 || value < 0 {
            None
        } else {
            Some(Ref(value as u64))
        }
    }

    /// The element value that stores this ref in a has-refs node.
    pub const fn to_element(self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encodes `n` as a tagged integer for storage in a has-refs node.
pub const fn to_tagged(n: u64) -> i64 {
    ((n << 1) | 1) as i64
}

/// Decodes a tagged integer written by [`to_tagged`].
pub const fn from_tagged(value: i64) -> u64 {
    (value as u64) >> 1
}

/// Caller misuse detected at a public API boundary.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum LogicError {
    /// The accessor was detached and cannot be used any more.
    #[error("accessor is detached")]
    DetachedAccessor,
    /// A row or element index was past the end of the sequence.
    #[error("index {index} out of bounds (size {size})")]
    IndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// The sequence size at the time of the call.
        size: usize,
    },
    /// A table index did not name a table.
    #[error("table index out of bounds")]
    TableOutOfBounds,
    /// A column index did not name a column.
    #[error("column index out of bounds")]
    ColumnOutOfBounds,
    /// The column kind does not support the requested operation.
    #[error("column kind mismatch")]
    ColumnKindMismatch,
    /// The column has no search index.
    #[error("column has no search index")]
    NoSearchIndex,
    /// A link pointed past the end of its target table.
    #[error("link target out of bounds")]
    InvalidLinkTarget,
    /// The table is the target of link columns in other tables.
    #[error("table is the target of links from other tables")]
    TableIsLinkTarget,
}

/// Errors produced by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The allocator could not obtain memory for a request.
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory {
        /// Bytes requested by the failing allocation.
        requested: usize,
    },
    /// No refs are left in the configured address space.
    #[error("ref address space exhausted")]
    AddressSpaceExhausted,
    /// Persisted data failed validation while opening or attaching.
    #[error("invalid database: {0}")]
    InvalidDatabase(&'static str),
    /// Structural corruption detected while using a tree.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller violated an API precondition.
    #[error("logic error: {0}")]
    Logic(#[from] LogicError),
    /// A unique search index already holds the value.
    #[error("duplicate value {0} in unique index")]
    DuplicateValue(i64),
    /// A previous mutation in this write failed; roll back before continuing.
    #[error("write transaction must be rolled back")]
    NeedsRollback,
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

pub mod node {
    //! Bit-exact node header layout shared by every persisted node.

    /// Length of a node header in bytes.
    pub const HEADER_LEN: usize = 8;

    /// Largest value representable in the 24-bit size and capacity fields.
    pub const MAX_HEADER_FIELD: usize = (1 << 24) - 1;

    /// Node sizes and refs are aligned to this many bytes.
    pub const NODE_ALIGN: usize = 8;

    pub mod header {
        //! Byte offsets for the header fields.
        use core::ops::Range;

        pub const CAPACITY: Range<usize> = 0..3;
        pub const RESERVED: usize = 3;
        pub const FLAGS: usize = 4;
        pub const SIZE: Range<usize> = 5..8;
    }

    /// Node is an inner B+-tree node.
    pub const FLAG_INNER_BPTREE: u8 = 0x80;
    /// Node elements may be child refs.
    pub const FLAG_HAS_REFS: u8 = 0x40;
    /// Free bit interpreted by the owner of the node.
    pub const FLAG_CONTEXT: u8 = 0x20;
    /// Mask selecting the width code.
    pub const WIDTH_MASK: u8 = 0x07;

    const WIDTHS: [u8; 8] = [0, 1, 2, 4, 8, 16, 32, 64];

    /// Maps a width code to a bit width.
    pub const fn width_from_code(code: u8) -> u8 {
        WIDTHS[(code & WIDTH_MASK) as usize]
    }

    /// Maps a bit width to its width code.
    pub fn code_from_width(width: u8) -> u8 {
        match width {
            0 => 0,
            1 => 1,
            2 => 2,
            4 => 3,
            8 => 4,
            16 => 5,
            32 => 6,
            64 => 7,
            _ => panic!("invalid element width {width}"),
        }
    }

    /// Decoded view of a node header.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct NodeHeader {
        /// Allocated bytes including the header.
        pub capacity: usize,
        /// Element count.
        pub size: usize,
        /// Bits per element.
        pub width: u8,
        /// Elements may be child refs.
        pub has_refs: bool,
        /// Node is an inner B+-tree node.
        pub inner_bptree: bool,
        /// Owner-defined flag.
        pub context: bool,
    }

    impl NodeHeader {
        /// Encodes the header into the first [`HEADER_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) {
            debug_assert!(self.capacity <= MAX_HEADER_FIELD);
            debug_assert!(self.size <= MAX_HEADER_FIELD);
            dst[header::CAPACITY].copy_from_slice(&(self.capacity as u32).to_be_bytes()[1..]);
            dst[header::RESERVED] = 0;
            let mut flags = code_from_width(self.width);
            if self.inner_bptree {
                flags |= FLAG_INNER_BPTREE;
            }
            if self.has_refs {
                flags |= FLAG_HAS_REFS;
            }
            if self.context {
                flags |= FLAG_CONTEXT;
            }
            dst[header::FLAGS] = flags;
            dst[header::SIZE].copy_from_slice(&(self.size as u32).to_be_bytes()[1..]);
        }

        /// Decodes a header without validating it against the surrounding bytes.
        pub fn decode(src: &[u8]) -> Self {
            let flags = src[header::FLAGS];
            Self {
                capacity: read_u24(&src[header::CAPACITY]),
                size: read_u24(&src[header::SIZE]),
                width: width_from_code(flags & WIDTH_MASK),
                has_refs: flags & FLAG_HAS_REFS != 0,
                inner_bptree: flags & FLAG_INNER_BPTREE != 0,
                context: flags & FLAG_CONTEXT != 0,
            }
        }

        /// Bytes needed to hold the header plus `size` elements of `width` bits.
        pub fn byte_size(&self) -> usize {
            byte_size_for(self.size, self.width)
        }
    }

    /// Bytes (header included, 8-aligned) needed for `size` elements of `width` bits.
    pub fn byte_size_for(size: usize, width: u8) -> usize {
        let payload = (size * width as usize).div_ceil(8);
        align(HEADER_LEN + payload)
    }

    /// Rounds `n` up to the node alignment.
    pub const fn align(n: usize) -> usize {
        (n + NODE_ALIGN - 1) & !(NODE_ALIGN - 1)
    }

    fn read_u24(bytes: &[u8]) -> usize {
        ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize
    }
}

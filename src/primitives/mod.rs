//! Low-level capabilities the storage layer is built on.
//!
//! Includes positioned file I/O, ref translation with the slab allocator,
//! and the database file framing.

/// Ref translation, the immutable image and the slab allocator.
pub mod alloc;

/// Database file header, read-only mapping and durable commits.
pub mod file;

/// Positioned file I/O.
pub mod io;

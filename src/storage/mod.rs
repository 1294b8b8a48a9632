//! Columnar storage engine and its core data structures.
//!
//! Every persisted structure is a tree of ref-addressed [`array::Array`]
//! nodes. Columns are B+-trees of such nodes, tables are bundles of equally
//! long columns, and a [`Group`] ties tables to one top ref, one writer
//! allocator and the committed image readers share.

/// Long-lived handles and the registries that keep them consistent.
pub mod accessor;

/// Bit-packed B+-tree node.
///
/// The physical node every other structure is built from.
pub mod array;

/// B+-tree over array nodes: descent, split, erase and inner-node bookkeeping.
pub mod bptree;

/// Typed column trees plus optional search indexes.
pub mod column;

/// Serialization of node trees into contiguous images.
pub mod writer;

mod group;
mod options;
mod read;
mod stats;
mod table;
mod verify;

pub use accessor::{AccessorState, LinkList, Row, TableRef};
pub use column::{ColumnFlags, ColumnKind};
pub use group::{Group, GroupStats, TableMut};
pub use options::{DbOptions, DEFAULT_MAX_NODE_SIZE, MIN_NODE_SIZE};
pub use read::{ReadView, TableReader};
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use table::TableView;
pub use verify::{verify_group, VerifySummary};

//! colstore: a columnar storage engine built from ref-addressed B+-tree nodes.
//!
//! Data lives in bit-packed array nodes addressed by integer refs. Columns are
//! B+-trees over those nodes, tables bundle equally long columns, and a
//! [`Group`] owns one writer transaction on top of the committed image. Commits
//! append only modified nodes and switch a single top ref, so pinned
//! [`ReadView`]s stay valid while the writer keeps going.

#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{ColumnKind, DbOptions, Group, ReadView, TableMut};
pub use types::{LogicError, Ref, Result, StoreError};

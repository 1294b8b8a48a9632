#![forbid(unsafe_code)]

//! Database administration and maintenance utilities.
//!
//! Every entry point takes a file path, opens the database itself and returns
//! a serde-serializable report, so the CLI can print text or JSON.

mod compact;
mod error;
mod options;
mod stats;
mod util;
mod verify;

/// Rewrites a database into a new file holding only live nodes.
pub use compact::{compact, CompactReport};

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Configuration options for opening a database in admin mode.
pub use options::AdminOpenOptions;

/// Per-table and per-column statistics.
pub use stats::{stats, ColumnStats, FileStats, StatsReport, TableStats};

/// Database integrity verification.
///
/// Verifies the structural integrity of the database and reports any issues found.
pub use verify::{verify, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity};

/// Utility functions for opening a database for inspection.
pub use util::{dump, open_group, DumpReport, DumpTable};

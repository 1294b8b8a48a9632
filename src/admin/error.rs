use std::path::{Path, PathBuf};

use crate::types::StoreError;
use thiserror::Error;

/// Failures of the admin entry points.
///
/// Storage and I/O failures pass through; the other variants describe
/// requests the admin layer itself refuses.
#[derive(Debug, Error)]
pub enum AdminError {
    /// No file exists at the given path.
    #[error("database not found: {}", .0.display())]
    MissingDatabase(PathBuf),
    /// `compact` never overwrites an existing file.
    #[error("destination {} already exists", .0.display())]
    DestinationExists(PathBuf),
    /// A table index past the end of the database.
    #[error("table {table} out of range; database has {tables} tables")]
    TableOutOfRange {
        /// Requested index.
        table: usize,
        /// Tables in the committed version.
        tables: usize,
    },
    /// Verification finished and reported errors.
    #[error("verification failed with {errors} error findings")]
    VerifyFailed {
        /// Findings of error severity.
        errors: usize,
    },
    /// Storage error while opening or reading the database.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// File system error outside the storage layer.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_database(path: impl AsRef<Path>) -> Self {
        AdminError::MissingDatabase(path.as_ref().to_path_buf())
    }

    /// Process exit code the CLI reports for this error.
    ///
    /// A completed verification that found damage exits with 2 so scripts can
    /// tell it apart from a run that could not check the file at all.
    pub fn exit_code(&self) -> i32 {
        match self {
            AdminError::VerifyFailed { .. } => 2,
            _ => 1,
        }
    }
}

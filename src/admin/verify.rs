use std::path::Path;

use serde::Serialize;

use crate::primitives::alloc::Image;
use crate::primitives::file::DbFile;
use crate::storage::verify_group;

use crate::admin::error::AdminError;
use crate::admin::Result;

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// File header and top ref only.
    Fast,
    /// Full walk of every reachable node.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Critical issue indicating data corruption or integrity failure.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// File length in bytes.
    pub file_bytes: u64,
    /// Nodes reachable from the top ref.
    pub nodes: u64,
    /// Bytes used by reachable nodes.
    pub node_bytes: u64,
    /// Tables found.
    pub tables: usize,
    /// Columns found across all tables.
    pub columns: usize,
    /// Rows found across all tables.
    pub rows: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether verification passed without finding any issues.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the data structures examined.
    pub counts: VerifyCounts,
}

impl VerifyReport {
    /// Turns a report with error findings into [`AdminError::VerifyFailed`].
    pub fn ensure_success(&self) -> Result<()> {
        if self.success {
            return Ok(());
        }
        let errors = self
            .findings
            .iter()
            .filter(|f| matches!(f.severity, VerifySeverity::Error))
            .count();
        Err(AdminError::VerifyFailed { errors })
    }
}

/// Verifies the integrity of a database file.
///
/// `Fast` validates the file header and the live top ref. `Full` also walks
/// every reachable node without trusting any of them, so a corrupt file
/// yields findings rather than an error.
///
/// # Errors
///
/// Returns an error if the file is missing or cannot be read. A file whose
/// header fails to decode is reported as a finding.
pub fn verify(path: impl AsRef<Path>, level: VerifyLevel) -> Result<VerifyReport> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(AdminError::missing_database(path));
    }
    let mut findings = Vec::new();
    let mut counts = VerifyCounts {
        file_bytes: std::fs::metadata(path)?.len(),
        ..VerifyCounts::default()
    };
    let file = match DbFile::open(path, false) {
        Ok(file) => file,
        Err(err) => {
            findings.push(VerifyFinding::error(format!("file header rejected: {err}")));
            return Ok(VerifyReport {
                level,
                success: false,
                findings,
                counts,
            });
        }
    };

    if matches!(level, VerifyLevel::Full) {
        let image = Image::from_bytes(file.map_readonly()?);
        let summary = verify_group(&image, file.read_top_ref(), image.len());
        counts.nodes = summary.nodes;
        counts.node_bytes = summary.bytes;
        counts.tables = summary.tables;
        counts.columns = summary.columns;
        counts.rows = summary.rows;
        for message in summary.findings {
            push_error(&mut findings, message);
        }
    }

    let success = findings
        .iter()
        .all(|f| !matches!(f.severity, VerifySeverity::Error));
    if success {
        findings.push(VerifyFinding {
            severity: VerifySeverity::Info,
            message: format!("top ref {} is sound", file.read_top_ref()),
        });
    }
    Ok(VerifyReport {
        level,
        success,
        findings,
        counts,
    })
}

fn push_error(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding::error(message));
    }
}

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::{ensure_parent_dir, open_group};
use crate::admin::{AdminError, Result};

/// Outcome of a compaction.
#[derive(Debug, Clone, Serialize)]
pub struct CompactReport {
    pub source: String,
    pub destination: String,
    pub version: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Writes the committed state of `src` into a fresh file at `dst`.
///
/// Commits append, so a long-lived file accumulates superseded nodes; the
/// copy holds only nodes reachable from the live top ref.
///
/// # Errors
///
/// Fails if `dst` already exists, or if `src` cannot be opened.
pub fn compact(src: impl AsRef<Path>, dst: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<CompactReport> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if dst.exists() {
        return Err(AdminError::DestinationExists(dst.to_path_buf()));
    }
    let group = open_group(src, opts)?;
    let bytes = group.write_to_bytes()?;
    ensure_parent_dir(dst)?;
    fs::write(dst, &bytes)?;
    let report = CompactReport {
        source: src.display().to_string(),
        destination: dst.display().to_string(),
        version: group.version(),
        bytes_before: fs::metadata(src)?.len(),
        bytes_after: bytes.len() as u64,
    };
    info!(
        target: "colstore::admin",
        before = report.bytes_before,
        after = report.bytes_after,
        version = report.version,
        "admin.compact.done"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ColumnKind, DbOptions, Group};
    use tempfile::tempdir;

    #[test]
    fn compacted_copy_drops_superseded_nodes() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.cs");
        let dst = dir.path().join("out/dst.cs");
        let mut g = Group::create(&src, DbOptions::default().sync_on_commit(false)).unwrap();
        let t = g.add_table().unwrap();
        g.table_mut(t).unwrap().add_column(ColumnKind::Int).unwrap();
        g.table_mut(t).unwrap().insert_rows(0, 50).unwrap();
        g.commit().unwrap();
        for round in 0..5 {
            g.table_mut(t).unwrap().set_int(0, round, round as i64 + 100).unwrap();
            g.commit().unwrap();
        }
        drop(g);

        let report = compact(&src, &dst, &AdminOpenOptions::inspect()).unwrap();
        assert!(report.bytes_after < report.bytes_before);
        let g = Group::open(&dst, DbOptions::default()).unwrap();
        assert_eq!(g.version(), 6);
        assert_eq!(g.pin_read().table(0).unwrap().get_int(0, 4).unwrap(), 104);
        assert!(matches!(
            compact(&src, &dst, &AdminOpenOptions::inspect()),
            Err(AdminError::DestinationExists(_))
        ));
    }
}

#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use colstore::admin::{self, AdminOpenOptions, VerifyLevel};
use colstore::storage::{ColumnKind, DbOptions, Group};
use colstore::types::Result;
use tempfile::tempdir;

fn options() -> DbOptions {
    DbOptions::default().max_node_size(8).sync_on_commit(false)
}

fn seed(path: &Path) -> Result<()> {
    let mut group = Group::create(path, options())?;
    let cities = group.add_table()?;
    let people = group.add_table()?;
    {
        let mut t = group.table_mut(cities)?;
        t.add_column(ColumnKind::Int)?;
        for zip in [1000, 2000, 3000] {
            let row = t.add_row()?;
            t.set_int(0, row, zip)?;
        }
    }
    let visited = {
        let mut t = group.table_mut(people)?;
        t.add_column(ColumnKind::Int)?;
        t.add_column(ColumnKind::Link { target: cities })?;
        t.add_column(ColumnKind::LinkList { target: cities })?;
        for i in 0..50 {
            let row = t.add_row()?;
            t.set_int(0, row, i * 3)?;
            t.set_link(1, row, Some(i as usize % 3))?;
        }
        t.add_search_index(0, false)?;
        t.link_list(2, 7)?
    };
    group.list_add(&visited, 2)?;
    group.list_add(&visited, 0)?;
    group.commit()?;
    Ok(())
}

#[test]
fn committed_state_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("reopen.colstore");
    seed(&path)?;

    let mut group = Group::open(&path, options())?;
    assert_eq!(group.version(), 1);
    assert_eq!(group.table_count(), 2);
    {
        let people = group.table(1)?;
        assert_eq!(people.size(), 50);
        assert_eq!(people.get_int(0, 49)?, 147);
        assert_eq!(people.get_link(1, 4)?, Some(1));
        assert_eq!(people.link_values(2, 7)?, vec![2, 0]);
        assert_eq!(people.find_first(0, 30)?, Some(10));
    }

    group.table_mut(0)?.erase_row(0)?;
    group.table_mut(1)?.set_int(0, 0, -1)?;
    group.commit()?;

    // Uncommitted work never reaches the file.
    group.table_mut(1)?.clear()?;
    drop(group);

    let mut group = Group::open(&path, options())?;
    assert_eq!(group.version(), 2);
    let people = group.table(1)?;
    assert_eq!(people.size(), 50);
    assert_eq!(people.get_int(0, 0)?, -1);
    assert_eq!(people.get_link(1, 0)?, None);
    assert_eq!(people.get_link(1, 1)?, Some(0));
    assert_eq!(people.link_values(2, 7)?, vec![1]);
    Ok(())
}

#[test]
fn rollback_after_commit_keeps_the_file_usable() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("rollback.colstore");
    seed(&path)?;

    let mut group = Group::open(&path, options())?;
    group.table_mut(1)?.add_column(ColumnKind::Bool)?;
    group.rollback()?;
    group.table_mut(0)?.add_row()?;
    group.commit()?;
    drop(group);

    let mut group = Group::open(&path, options())?;
    assert_eq!(group.table(0)?.size(), 4);
    assert_eq!(group.table(1)?.column_count(), 3);
    Ok(())
}

#[test]
fn admin_reports_on_a_seeded_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("admin.colstore");
    seed(&path)?;
    {
        let mut group = Group::open(&path, options())?;
        for _ in 0..3 {
            group.table_mut(1)?.set_int(0, 3, 4)?;
            group.table_mut(1)?.set_int(0, 3, 9)?;
            group.commit()?;
        }
    }

    let report = admin::verify(&path, VerifyLevel::Full).expect("verify");
    assert!(report.success, "{:?}", report.findings);
    assert_eq!(report.counts.tables, 2);
    assert_eq!(report.counts.rows, 53);

    let stats = admin::stats(&path, &AdminOpenOptions::inspect()).expect("stats");
    assert_eq!(stats.file.version, 4);
    assert_eq!(stats.tables[1].columns.len(), 3);
    assert!(stats.tables[1].columns[0].indexed);
    assert_eq!(stats.tables[1].columns[2].kind, "link_list->0");

    let compacted = dir.path().join("compacted.colstore");
    let summary = admin::compact(&path, &compacted, &AdminOpenOptions::inspect()).expect("compact");
    assert!(summary.bytes_after < summary.bytes_before);
    assert_eq!(fs::metadata(&compacted)?.len(), summary.bytes_after);

    let mut group = Group::open(&compacted, options())?;
    assert_eq!(group.table(1)?.get_int(0, 3)?, 9);
    assert_eq!(group.table(1)?.link_values(2, 7)?, vec![2, 0]);
    Ok(())
}

#[test]
fn corrupt_files_are_rejected_at_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("corrupt.colstore");
    seed(&path)?;
    let mut bytes = fs::read(&path)?;
    let len = bytes.len();
    for b in &mut bytes[len - 64..] {
        *b = 0xff;
    }
    fs::write(&path, &bytes)?;

    assert!(Group::open(&path, options()).is_err());
    let report = admin::verify(&path, VerifyLevel::Full).expect("verify");
    assert!(!report.success);
    assert!(!report.findings.is_empty());
    Ok(())
}

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use colstore::storage::{ColumnKind, DbOptions, Group};
use serde_json::Value;
use tempfile::TempDir;

fn setup_db(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.colstore"));
    seed_demo(&path).expect("seed demo data");
    (dir, path)
}

fn seed_demo(path: &Path) -> colstore::types::Result<()> {
    let mut group = Group::create(path, DbOptions::default().sync_on_commit(false))?;
    let teams = group.add_table()?;
    let players = group.add_table()?;
    {
        let mut t = group.table_mut(teams)?;
        t.add_column(ColumnKind::Int)?;
        t.add_column(ColumnKind::Bool)?;
        for (row, founded) in [1901, 1923, 1950].into_iter().enumerate() {
            t.add_row()?;
            t.set_int(0, row, founded)?;
            t.set_bool(1, row, founded < 1930)?;
        }
    }
    {
        let mut p = group.table_mut(players)?;
        p.add_column(ColumnKind::Int)?;
        p.add_column(ColumnKind::Link { target: teams })?;
        for row in 0..5 {
            p.add_row()?;
            p.set_int(0, row, 10 + row as i64)?;
            p.set_link(1, row, Some(row % 3))?;
        }
        p.add_search_index(0, true)?;
    }
    group.commit()?;
    group.table_mut(players)?.set_int(0, 0, 99)?;
    group.commit()?;
    Ok(())
}

#[test]
fn stats_emits_json() {
    let (_dir, db_path) = setup_db("stats");
    let output = cargo_bin_cmd!("colstore")
        .args(["--format", "json", "stats"])
        .arg(&db_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["file"]["version"].as_u64(), Some(2));
    assert_eq!(json["tables"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["tables"][1]["columns"][0]["unique"].as_bool(), Some(true));
    assert!(json["alloc"]["slab_bytes"].is_number());
}

#[test]
fn verify_full_succeeds() {
    let (_dir, db_path) = setup_db("verify");
    let output = cargo_bin_cmd!("colstore")
        .args(["--format", "json", "verify", "--level", "full"])
        .arg(&db_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert!(json["success"].as_bool().unwrap_or(false));
    assert_eq!(json["counts"]["rows"].as_u64(), Some(8));
}

#[test]
fn verify_reports_corruption_with_exit_code() {
    let (_dir, db_path) = setup_db("verify-corrupt");
    let mut bytes = fs::read(&db_path).expect("read db");
    let len = bytes.len();
    bytes[len - 40..].fill(0xff);
    fs::write(&db_path, &bytes).expect("write db");
    let output = cargo_bin_cmd!("colstore")
        .args(["verify", "--level", "full"])
        .arg(&db_path)
        .assert()
        .code(2)
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("verification failed"));
}

#[test]
fn dump_lists_cells() {
    let (_dir, db_path) = setup_db("dump");
    let output = cargo_bin_cmd!("colstore")
        .args(["--format", "json", "dump", "--max-rows", "2"])
        .arg(&db_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    let players = &json["tables"][1];
    assert_eq!(players["rows"].as_u64(), Some(5));
    assert_eq!(players["values"].as_array().map(Vec::len), Some(2));
    assert_eq!(players["values"][0][0].as_i64(), Some(99));
    assert_eq!(players["values"][1][1].as_u64(), Some(1));
}

#[test]
fn dump_single_table_and_bad_index() {
    let (_dir, db_path) = setup_db("dump-table");
    let output = cargo_bin_cmd!("colstore")
        .args(["--format", "json", "dump", "--table", "0"])
        .arg(&db_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["tables"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["tables"][0]["rows"].as_u64(), Some(3));

    let output = cargo_bin_cmd!("colstore")
        .args(["dump", "--table", "5"])
        .arg(&db_path)
        .assert()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&output);
    assert!(stderr.contains("table 5 out of range"), "{stderr}");
}

#[test]
fn compact_writes_destination_file() {
    let (dir, db_path) = setup_db("compact");
    let dst = dir.path().join("compacted.colstore");
    cargo_bin_cmd!("colstore")
        .arg("compact")
        .arg(&db_path)
        .arg("--into")
        .arg(&dst)
        .assert()
        .success();
    assert!(dst.exists(), "compact destination file should be created");
    let src_size = fs::metadata(&db_path).unwrap().len();
    let dst_size = fs::metadata(&dst).unwrap().len();
    assert!(dst_size < src_size);

    cargo_bin_cmd!("colstore")
        .arg("compact")
        .arg(&db_path)
        .arg("--into")
        .arg(&dst)
        .assert()
        .failure();
}

#[test]
fn missing_database_fails() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("colstore")
        .arg("stats")
        .arg(dir.path().join("absent.colstore"))
        .assert()
        .code(1);
}

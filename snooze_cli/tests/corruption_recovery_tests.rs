//! Corruption recovery tests for the snooze binary.
//!
//! These tests verify the system can handle:
//! - Unparseable ledger files
//! - Documents that parse but break the per-user invariants
//! - Empty and missing files

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const T0: &str = "2024-01-15T23:00:00+09:00";

fn cli(data_dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_snooze"));
    cmd.env("SNOOZE_CONFIG", data_dir.join("no-such-config.toml"))
        .arg("--data-dir")
        .arg(data_dir);
    cmd
}

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

#[test]
fn test_corrupted_ledger_is_reported_and_kept() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    let ledger_path = data_dir.join("sleep_data.json");
    fs::write(&ledger_path, "{ invalid json }}}}").expect("Failed to write corrupted ledger");

    cli(data_dir)
        .args(["--at", T0, "sleep", "alice"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("corrupted"));

    cli(data_dir)
        .args(["--at", T0, "status"])
        .assert()
        .code(2);

    // The broken document is never replaced by a fresh one
    let contents = fs::read_to_string(&ledger_path).unwrap();
    assert_eq!(contents, "{ invalid json }}}}");
}

#[test]
fn test_sleeping_without_start_is_corruption() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    let ledger_path = data_dir.join("sleep_data.json");
    let document = r#"{"alice": {"is_sleeping": true, "sleep_records": []}}"#;
    fs::write(&ledger_path, document).unwrap();

    cli(data_dir)
        .args(["--at", T0, "wake", "alice"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("is_sleeping without sleep_start"));

    assert_eq!(fs::read_to_string(&ledger_path).unwrap(), document);
}

#[test]
fn test_whitespace_ledger_is_empty() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    fs::write(data_dir.join("sleep_data.json"), "  \n").unwrap();

    cli(data_dir)
        .args(["--at", T0, "sleep", "alice"])
        .assert()
        .success();

    let contents = fs::read_to_string(data_dir.join("sleep_data.json")).unwrap();
    assert!(contents.contains("\"alice\""));
}

#[test]
fn test_missing_data_dir_is_created() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().join("nested").join("data");

    cli(&data_dir)
        .args(["--at", T0, "sleep", "alice"])
        .assert()
        .success();

    assert!(data_dir.join("sleep_data.json").exists());
}

#[test]
fn test_legacy_timestamps_are_accepted() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    let document = r#"{
  "alice": {
    "is_sleeping": false,
    "sleep_end": "2024-01-16T07:00:00.123456+09:00",
    "sleep_records": [
      {
        "sleep_start": "2024-01-15T23:00:00.123456+09:00",
        "sleep_end": "2024-01-16T07:00:00.123456+09:00",
        "duration_minutes": 480
      }
    ]
  }
}"#;
    fs::write(data_dir.join("sleep_data.json"), document).unwrap();

    cli(data_dir)
        .args(["--at", "2024-01-16T09:00:30+09:00", "status", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Average sleep: 8h 0m"))
        .stdout(predicate::str::contains("(2h 0m awake)"));
}

#[test]
fn test_bad_config_is_rejected() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    let config = data_dir.join("config.toml");
    fs::write(&config, "[clock]\nutc_offset_minutes = 100000\n").unwrap();

    cli(data_dir)
        .env("SNOOZE_CONFIG", &config)
        .args(["--at", T0, "sleep", "alice"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Error:"));
}

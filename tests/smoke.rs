//! Smoke tests -- verify the binary runs and the subcommands work end to end.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn logintel() -> Command {
    let mut cmd = Command::cargo_bin("logintel").unwrap();
    cmd.env_remove("LOGINTEL_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn sample_log() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for i in 0..15 {
        writeln!(
            file,
            r#"{{"timestamp":"2024-05-01T10:00:{:02}Z","ip":"198.51.100.7","user":"admin","endpoint":"/login","status":401,"latency_ms":30}}"#,
            i * 3
        )
        .unwrap();
    }
    writeln!(file, "not a log line").unwrap();
    file
}

#[test]
fn test_cli_help() {
    logintel()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Log intelligence engine"));
}

#[test]
fn test_cli_version() {
    logintel()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("logintel"));
}

#[test]
fn test_techniques_lists_mitre_ids() {
    logintel()
        .arg("techniques")
        .assert()
        .success()
        .stdout(predicate::str::contains("T1110.004").and(predicate::str::contains("T1583.005")));
}

#[test]
fn test_config_prints_defaults() {
    logintel()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("brute_force_threshold = 10"));
}

#[test]
fn test_analyze_summary() {
    let log = sample_log();
    logintel()
        .arg("analyze")
        .arg(log.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("brute-force").and(predicate::str::contains("T1110")));
}

#[test]
fn test_analyze_json_and_export() {
    let log = sample_log();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("report.json");
    let assert = logintel()
        .args(["analyze", "--json", "--format", "json", "--output"])
        .arg(&out)
        .arg(log.path())
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["parse"]["parsed"], 15);
    assert_eq!(report["parse"]["failed"], 1);
    assert!(out.exists());
}

#[test]
fn test_analyze_rejects_unknown_format() {
    let log = sample_log();
    logintel()
        .args(["analyze", "--format", "xml"])
        .arg(log.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown log format"));
}

#[test]
fn test_analyze_rejects_invalid_config() {
    let log = sample_log();
    let mut cfg = tempfile::NamedTempFile::new().unwrap();
    writeln!(cfg, "[ml]\ncontamination = 0.9").unwrap();
    logintel()
        .arg("analyze")
        .arg("--config")
        .arg(cfg.path())
        .arg(log.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("ml.contamination"));
}

#[test]
fn test_unreadable_local_config_warns_and_falls_back() {
    let log = sample_log();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("logintel.toml"), "[window\nsize_secs = ").unwrap();
    logintel()
        .current_dir(dir.path())
        .arg("analyze")
        .arg(log.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("could not be loaded"))
        .stdout(predicate::str::contains("brute-force"));
}

#[test]
fn test_analyze_rejects_oversized_window() {
    let log = sample_log();
    let mut cfg = tempfile::NamedTempFile::new().unwrap();
    writeln!(cfg, "[window]\nsize_secs = 9223372036854775").unwrap();
    logintel()
        .arg("analyze")
        .arg("--config")
        .arg(cfg.path())
        .arg(log.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("window.size_secs"));
}

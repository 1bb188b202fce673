//! CLI tests for the tally binary.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

const CONFIG: &str = r#"
[engine]
tick_interval_secs = 0

[[rules]]
target = "washer.energy"
period = 5
preset = "cycle-done"

[[presets]]
presetId = "cycle-done"

[presets.message]
title = "Washing finished"

[signals."washer.energy"]
label = "Washing machine"
unit = "kWh"
"#;

const EVENTS: &str = r#"{"type":"state","id":"washer.energy","val":100}
{"type":"state","id":"washer.energy","val":104}
# comment lines are skipped
not json either
{"type":"state","id":"washer.energy","val":107.5}
{"type":"tick"}
"#;

fn write_config(dir: &Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("tally.toml");
    std::fs::write(&path, content).unwrap();
    path
}

fn tally() -> Command {
    let mut cmd = Command::cargo_bin("tally").unwrap();
    cmd.env_remove("TALLY_CONFIG")
        .env_remove("TALLY_DATA_DIR")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    tally()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_cli_version() {
    tally()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tally"));
}

#[test]
fn test_no_subcommand_shows_error() {
    tally().assert().failure();
}

#[test]
fn test_validate_reports_summary() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CONFIG);

    tally()
        .arg("validate")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 rules, 1 presets, 1 signals"));
}

#[test]
fn test_validate_rejects_bad_period() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "[[rules]]\ntarget = \"a\"\nperiod = -2\n");

    tally()
        .arg("validate")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("period"));
}

#[test]
fn test_missing_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();

    tally()
        .arg("validate")
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_run_then_status() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CONFIG);
    let data = dir.path().join("data");

    tally()
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--data-dir")
        .arg(&data)
        .write_stdin(EVENTS)
        .assert()
        .success();

    let output = tally()
        .arg("status")
        .arg("--json")
        .arg("--config")
        .arg(&config)
        .arg("--data-dir")
        .arg(&data)
        .output()
        .unwrap();
    assert!(output.status.success());

    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 1);
    assert_eq!(rows[0]["rule"], "cycle.washer.energy");
    assert_eq!(rows[0]["lastCounter"], 107.5);
    assert_eq!(rows[0]["subCounter"], 7.5);
    assert_eq!(rows[0]["period"], 5.0);

    tally()
        .arg("status")
        .arg("--config")
        .arg(&config)
        .arg("--data-dir")
        .arg(&data)
        .assert()
        .success()
        .stdout(predicate::str::contains("cycle.washer.energy"))
        .stdout(predicate::str::contains("150%"));
}

#[test]
fn test_run_resumes_and_prints_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CONFIG);
    let data = dir.path().join("data");

    tally()
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--data-dir")
        .arg(&data)
        .write_stdin("{\"type\":\"state\",\"id\":\"washer.energy\",\"val\":10}\n{\"type\":\"state\",\"id\":\"washer.energy\",\"val\":12}\n")
        .assert()
        .success();

    // Second run continues from the stored counters
    tally()
        .arg("run")
        .arg("--print-mirror")
        .arg("--config")
        .arg(&config)
        .arg("--data-dir")
        .arg(&data)
        .write_stdin("{\"type\":\"state\",\"id\":\"washer.energy\",\"val\":13}\n")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "tally.counters.cycle.washer.energy.subCounter",
        ))
        .stdout(predicate::str::contains("\"ack\":true"))
        .stdout(predicate::str::contains("\"val\":3.0"));
}

#[test]
fn test_status_without_counters() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CONFIG);

    tally()
        .arg("status")
        .arg("--config")
        .arg(&config)
        .arg("--data-dir")
        .arg(dir.path().join("empty"))
        .assert()
        .success()
        .stdout(predicate::str::contains("No counters stored."));
}

// CLI integration tests for the simulate and diagnose commands
#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn gputrace() -> Command {
    Command::cargo_bin("gputrace").unwrap()
}

#[test]
fn test_simulate_text_output() {
    gputrace()
        .args(["simulate", "--threads", "2", "--launches", "4", "--seed", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Compute"))
        .stdout(predicate::str::contains("[step:0]"))
        .stdout(predicate::str::contains("callback events dropped: 0"))
        .stdout(predicate::str::contains("activity records dropped by driver: 0"));
}

#[test]
fn test_simulate_without_activity() {
    gputrace()
        .args(["simulate", "-t", "1", "-n", "2", "--no-activity", "--seed", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(", 0 activity)"));
}

#[test]
fn test_simulate_callback_cap() {
    gputrace()
        .args([
            "simulate",
            "-t",
            "1",
            "-n",
            "3",
            "--no-activity",
            "--max-callback-events",
            "5",
            "--seed",
            "3",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("5 events (5 callback, 0 activity)"))
        .stdout(predicate::str::contains("callback events dropped: 0").not());
}

#[test]
fn test_simulate_json_lines() {
    let output = gputrace()
        .args(["simulate", "-t", "1", "-n", "2", "--format", "json", "--seed", "11"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let (summary, events) = lines.split_last().unwrap();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.get("correlation_id").is_some()));

    let summary = &summary["summary"];
    assert_eq!(summary["total_events"].as_u64().unwrap() as usize, events.len());
    assert!(summary["activity_events"].as_u64().unwrap() > 0);
}

#[test]
fn test_simulate_with_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trace.toml");
    fs::write(
        &path,
        "[tracer]\ncbids_selected = [\"cuLaunchKernel\"]\nactivities_selected = [\"concurrent_kernel\"]\n",
    )
    .unwrap();

    gputrace()
        .args(["simulate", "-t", "1", "-n", "3", "--seed", "5", "-c"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("6 events (3 callback, 3 activity)"));
}

#[test]
fn test_simulate_bad_config_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "[tracer]\nunknown_option = 1\n").unwrap();

    gputrace()
        .args(["simulate", "-c"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_diagnose_ok() {
    gputrace()
        .arg("diagnose")
        .assert()
        .success()
        .stdout(predicate::str::diff("ok\n"));
}

#[test]
fn test_diagnose_without_gpu() {
    gputrace()
        .args(["diagnose", "--no-gpu"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No GPU detected."));
}

#[test]
fn test_diagnose_unprivileged() {
    gputrace()
        .args(["diagnose", "--unprivileged"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Insufficient privilege"));
}

#[test]
fn test_missing_subcommand() {
    gputrace().assert().failure();
}

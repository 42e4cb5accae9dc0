//! Integration tests for the modscope binary
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

mod utils;

use modscope::clock::ManualClock;
use modscope::host::CallKind;
use modscope::remote;
use predicates::prelude::*;
use std::io::Write;
use std::sync::Arc;
use utils::{call, test_recorder, FakeHost};

fn write_log(lines: &[&str]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    file.flush().unwrap();
    file
}

#[test]
fn test_decode_prints_timeline_json() {
    let log = write_log(&["0 A", "0 B", "1 0 1", "3 50", "2 0", "3 100", "2 0"]);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("decode").arg(log.path());

    let output = cmd.output().unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["modules"], serde_json::json!(["A", "B"]));
    assert_eq!(parsed["callsites"], serde_json::json!([[0, 1]]));
    assert_eq!(
        parsed["calls"],
        serde_json::json!([{"when": 100, "callsite": 0, "count": 2}])
    );
}

#[test]
fn test_decode_writes_output_file() {
    let log = write_log(&["0 A", "9 hello world"]);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("timeline.json");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("decode").arg(log.path()).arg("-o").arg(&out);
    cmd.assert().success().stdout(predicate::str::is_empty());

    let json = std::fs::read_to_string(&out).unwrap();
    assert!(json.contains("\"hello world\""));
}

#[test]
fn test_decode_reports_malformed_lines_on_stderr() {
    let log = write_log(&["0 A", "garbage"]);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("decode").arg(log.path());
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"malformed_lines\": 1"))
        .stderr(predicate::str::contains("skipping malformed trace line"));
}

#[test]
fn test_decode_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("decode").arg(dir.path().join("absent.txt"));
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to decode"));
}

#[test]
fn test_decode_with_config_file() {
    let log = write_log(&["0 A", "0 B", "1 0 1", "2 0", "3 40", "2 0"]);
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, "[decoder]\ncoalesce_gap_ms = 10").unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("decode")
        .arg(log.path())
        .arg("--config")
        .arg(config.path());
    let output = cmd.output().unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["calls"].as_array().unwrap().len(), 2);
}

#[test]
fn test_decode_rejects_invalid_config() {
    let log = write_log(&["0 A"]);
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, "[recorder]\nheap_every = 0").unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("decode")
        .arg(log.path())
        .arg("--config")
        .arg(config.path());
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("heap_every"));
}

#[test]
fn test_control_drives_live_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("controlled.txt");
    let clock = Arc::new(ManualClock::new(0));
    let recorder = test_recorder(&path, clock.clone(), Arc::new(FakeHost::default()));
    let handle = remote::listen(recorder.clone(), "127.0.0.1:0").unwrap();
    let url = handle.base_url();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("control").arg("start").arg("--url").arg(&url);
    cmd.assert().success();
    assert!(recorder.is_tracing());

    clock.advance(7);
    recorder.on_call_event(CallKind::Entered, &call(1, "b.py", "a.py"));

    let fetched = dir.path().join("fetched.txt");
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("control")
        .arg("trace")
        .arg("--url")
        .arg(&url)
        .arg("-o")
        .arg(&fetched);
    cmd.assert().success();
    assert!(std::fs::read_to_string(&fetched)
        .unwrap()
        .contains("3 7\n2 0\n"));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("control").arg("stop").arg("--url").arg(&url);
    cmd.assert().success();
    assert!(!recorder.is_tracing());

    handle.shutdown();
}

#[test]
fn test_control_url_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = test_recorder(
        &dir.path().join("configured.txt"),
        Arc::new(ManualClock::new(0)),
        Arc::new(FakeHost::default()),
    );
    let handle = remote::listen(recorder.clone(), "127.0.0.1:0").unwrap();
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        config,
        "[remote]\nhost = \"127.0.0.1\"\nport = {}",
        handle.local_addr().port()
    )
    .unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("control")
        .arg("start")
        .arg("--config")
        .arg(config.path());
    cmd.assert().success();
    assert!(recorder.is_tracing());

    // An explicit --url wins over the config file
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("control")
        .arg("stop")
        .arg("--config")
        .arg(config.path())
        .arg("--url")
        .arg("http://127.0.0.1:1");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Remote stop failed"));
    assert!(recorder.is_tracing());

    handle.shutdown();
}

#[test]
fn test_control_rejects_invalid_config() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, "[remote]\nport = \"not a port\"").unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("control")
        .arg("start")
        .arg("--config")
        .arg(config.path());
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_control_unreachable_endpoint_fails() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("control")
        .arg("start")
        .arg("--url")
        .arg("http://127.0.0.1:1");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Remote start failed"));
}

#[test]
fn test_help_lists_subcommands() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("modscope");
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("decode"))
        .stdout(predicate::str::contains("control"));
}

//! CLI Integration Tests
//!
//! These tests verify the CLI commands work correctly end-to-end.
//! They test the "wiring" between the CLI and the core library.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("scuttlenode").expect("Failed to find scuttlenode binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().expect("command runs");
    assert!(output.status.success(), "command failed: {:?}", output);
    String::from_utf8(output.stdout).expect("utf-8 output")
}

/// Identity printed by `init` ("Identity: @...")
fn local_identity(data_dir: &TempDir) -> String {
    let out = stdout_of(cli_cmd(data_dir).arg("init"));
    out.lines()
        .find_map(|line| line.strip_prefix("Identity: "))
        .expect("identity line")
        .trim()
        .to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_init_writes_config() {
    let data_dir = TempDir::new().unwrap();
    let identity = local_identity(&data_dir);
    assert!(identity.starts_with('@') && identity.ends_with(".ed25519"));
    assert!(data_dir.path().join("config.json").exists());

    // Same identity on the next start
    assert_eq!(local_identity(&data_dir), identity);
}

#[test]
fn test_status_shows_identity() {
    let data_dir = TempDir::new().unwrap();
    let identity = local_identity(&data_dir);

    cli_cmd(&data_dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains(identity))
        .stdout(predicate::str::contains("\"receive_log_len\": 0"));
}

#[test]
fn test_publish_then_receive_log() {
    let data_dir = TempDir::new().unwrap();
    for text in ["one", "two", "three"] {
        cli_cmd(&data_dir)
            .arg("publish")
            .arg(format!(r#"{{"type":"post","text":"{}"}}"#, text))
            .assert()
            .success()
            .stdout(predicate::str::ends_with(".sha256\n"));
    }

    let out = stdout_of(cli_cmd(&data_dir).args(["receive-log", "--from", "0", "--limit", "10"]));
    let lines: Vec<serde_json::Value> = out.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["sequence"], 0);
    assert_eq!(lines[2]["message"]["value"]["content"]["text"], "three");

    let out = stdout_of(cli_cmd(&data_dir).args(["receive-log", "--from", "1", "--limit", "1"]));
    assert_eq!(out.lines().count(), 1);
    assert!(out.contains("\"two\""));
}

#[test]
fn test_published_log_after() {
    let data_dir = TempDir::new().unwrap();
    for n in 0..3 {
        cli_cmd(&data_dir)
            .arg("publish")
            .arg(format!(r#"{{"type":"post","n":{}}}"#, n))
            .assert()
            .success();
    }
    let out = stdout_of(cli_cmd(&data_dir).args(["published-log", "--after", "0"]));
    assert_eq!(out.lines().count(), 2);
}

#[test]
fn test_publish_invalid_json_fails() {
    let data_dir = TempDir::new().unwrap();
    cli_cmd(&data_dir)
        .arg("publish")
        .arg("{not json")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn test_follow() {
    let alice = TempDir::new().unwrap();
    let bob = TempDir::new().unwrap();
    let bob_id = local_identity(&bob);

    cli_cmd(&alice).arg("follow").arg(&bob_id).assert().success();

    let out = stdout_of(cli_cmd(&alice).args(["receive-log"]));
    let entry: serde_json::Value = serde_json::from_str(out.lines().next().unwrap()).unwrap();
    let content = &entry["message"]["value"]["content"];
    assert_eq!(content["type"], "contact");
    assert_eq!(content["contact"], bob_id.as_str());
    assert_eq!(content["following"], true);
}

#[test]
fn test_follow_invalid_identity_fails() {
    let data_dir = TempDir::new().unwrap();
    cli_cmd(&data_dir)
        .arg("follow")
        .arg("not-an-identity")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid identity"));
}

#[test]
fn test_ban_and_unban() {
    let data_dir = TempDir::new().unwrap();
    let other = TempDir::new().unwrap();
    let feed = local_identity(&other);

    cli_cmd(&data_dir)
        .arg("ban")
        .arg(&feed)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("Banned "));
    cli_cmd(&data_dir)
        .arg("unban")
        .arg(&feed)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("Unbanned "));
    cli_cmd(&data_dir)
        .arg("unban")
        .arg(&feed)
        .assert()
        .success()
        .stdout(predicate::str::contains("was not banned"));
}

#[test]
fn test_want_and_unwant() {
    let data_dir = TempDir::new().unwrap();
    let other = TempDir::new().unwrap();
    let feed = local_identity(&other);

    cli_cmd(&data_dir)
        .args(["want", &feed, "--days", "2"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("Wanting "));
    cli_cmd(&data_dir)
        .args(["want", &feed, "--days", "0"])
        .assert()
        .code(1);
    cli_cmd(&data_dir).args(["unwant", &feed]).assert().success();
}

#[test]
fn test_connect_refused_fails() {
    let data_dir = TempDir::new().unwrap();
    let other = TempDir::new().unwrap();
    let identity = local_identity(&other);

    // Bind and drop a listener to get a port nothing listens on
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    cli_cmd(&data_dir)
        .arg("connect")
        .arg(&identity)
        .arg(format!("127.0.0.1:{}", port))
        .assert()
        .code(1);
}

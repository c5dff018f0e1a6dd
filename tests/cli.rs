//! CLI tests for the relay binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

use relay::workflow::db::SessionDb;
use relay::workflow::models::NewSession;

/// relay command isolated in `dir`: config, database and .env all live there.
fn relay(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("relay");
    cmd.current_dir(dir.path())
        .env("RELAY_HOME", dir.path())
        .env_remove("RELAY_ALLOWED_USERS")
        .env_remove("RELAY_PORT")
        .env_remove("RUST_LOG");
    cmd
}

fn seed_session(dir: &TempDir, repo: &str, issue: u64) -> String {
    let db = SessionDb::new(&dir.path().join("sessions.db")).unwrap();
    db.create_session(&NewSession {
        repo: repo.into(),
        issue,
        pr: None,
        author: "alice".into(),
        trigger_text: "@relay plan".into(),
        comment_id: None,
    })
    .unwrap()
    .id
}

// =============================================================================
// Basics
// =============================================================================

#[test]
fn test_help() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("trigger"))
        .stdout(predicate::str::contains("sessions"));
}

#[test]
fn test_version() {
    let dir = TempDir::new().unwrap();
    relay(&dir).arg("--version").assert().success();
}

// =============================================================================
// Config
// =============================================================================

#[test]
fn test_config_init_then_show() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created relay.toml"));
    assert!(dir.path().join("relay.toml").exists());

    relay(&dir)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));

    relay(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[github]"))
        .stdout(predicate::str::contains("bot_name = \"relay\""));
}

#[test]
fn test_config_show_masks_token() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("relay.toml"),
        "[github]\ntoken = \"ghp_secret\"\n",
    )
    .unwrap();
    relay(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ghp_secret").not())
        .stdout(predicate::str::contains("***"));
}

#[test]
fn test_config_check_reports_empty_allowlist() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["config", "check"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("allowed_users"));
}

#[test]
fn test_explicit_config_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.toml");
    relay(&dir)
        .arg("--config")
        .arg(&path)
        .args(["config", "init"])
        .assert()
        .success();
    assert!(path.exists());
}

// =============================================================================
// Sessions
// =============================================================================

#[test]
fn test_sessions_list_without_database() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["sessions", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No session database"));
}

#[test]
fn test_sessions_list_and_show() {
    let dir = TempDir::new().unwrap();
    let first = seed_session(&dir, "acme/widgets", 42);
    seed_session(&dir, "acme/gadgets", 7);

    relay(&dir)
        .args(["sessions", "list", "--repo", "acme/widgets"])
        .assert()
        .success()
        .stdout(predicate::str::contains(first.as_str()))
        .stdout(predicate::str::contains("acme/widgets#42"))
        .stdout(predicate::str::contains("acme/gadgets").not());

    relay(&dir)
        .args(["sessions", "show", &first])
        .assert()
        .success()
        .stdout(predicate::str::contains("acme/widgets#42"))
        .stdout(predicate::str::contains("created"));

    let output = relay(&dir)
        .args(["sessions", "list", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let sessions: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(sessions.len(), 2);
}

#[test]
fn test_sessions_list_rejects_unknown_state() {
    let dir = TempDir::new().unwrap();
    seed_session(&dir, "acme/widgets", 1);
    relay(&dir)
        .args(["sessions", "list", "--state", "sleeping"])
        .assert()
        .failure();
}

#[test]
fn test_sessions_show_missing() {
    let dir = TempDir::new().unwrap();
    seed_session(&dir, "acme/widgets", 1);
    relay(&dir)
        .args(["sessions", "show", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

// =============================================================================
// Trigger and recovery guards
// =============================================================================

#[test]
fn test_trigger_rejects_unknown_command() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["trigger", "acme/widgets", "42", "deploy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid command: deploy"));
}

#[test]
fn test_trigger_rejects_bad_repo() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["trigger", "widgets", "42", "plan"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("owner/name"));
}

#[test]
fn test_recover_requires_force() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .arg("recover")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
}

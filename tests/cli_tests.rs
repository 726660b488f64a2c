//! CLI integration tests using assert_cmd.
//!
//! These tests invoke the actual `translateable` binary and verify its output.

use assert_cmd::Command;
use predicates::prelude::*;

#[allow(deprecated)]
fn translateable_cmd() -> Command {
    Command::cargo_bin("translateable").expect("binary should exist")
}

#[test]
fn test_version_flag() {
    translateable_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_help_flag() {
    translateable_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("manga translation job pipeline"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("cancel"))
        .stdout(predicate::str::contains("delete"))
        .stdout(predicate::str::contains("download"))
        .stdout(predicate::str::contains("health"));
}

#[test]
fn test_submit_help_shows_options() {
    translateable_cmd()
        .args(["submit", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--url"))
        .stdout(predicate::str::contains("--to"))
        .stdout(predicate::str::contains("--from"))
        .stdout(predicate::str::contains("--fail-fast"))
        .stdout(predicate::str::contains("--wait"));
}

#[test]
fn test_serve_help() {
    translateable_cmd()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--data-dir"))
        .stdout(predicate::str::contains("--listen-port"));
}

#[test]
fn test_submit_without_source_fails() {
    translateable_cmd()
        .arg("submit")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_submit_missing_file_reports_error() {
    translateable_cmd()
        .args(["--port", "1", "submit", "/definitely/not/here/page-01.png"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn test_health_without_daemon_reports_connection_error() {
    translateable_cmd()
        .args(["--port", "1", "health"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Could not connect"));
}

#[test]
fn test_no_subcommand_shows_help() {
    translateable_cmd()
        .assert()
        .success()
        .stdout(predicate::str::contains("manga translation job pipeline"));
}

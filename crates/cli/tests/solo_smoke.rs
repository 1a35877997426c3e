//! Black-box smoke tests over the `blockspool` binary's `solo` subcommand
//! tree, invoked the way a user's shell would.

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn blockspool() -> Command {
    Command::cargo_bin("blockspool").unwrap()
}

#[test]
fn status_without_a_session_fails_with_a_clear_message() {
    let dir = tempdir().unwrap();
    blockspool()
        .args(["--project", dir.path().to_str().unwrap(), "solo", "status"])
        .assert()
        .failure()
        .stderr(contains("no active session"));
}

#[test]
fn init_then_scout_creates_a_session_directory() {
    let dir = tempdir().unwrap();
    let project = dir.path().to_str().unwrap();

    blockspool().args(["--project", project, "solo", "init"]).assert().success();

    blockspool()
        .args(["--project", project, "solo", "scout"])
        .assert()
        .success()
        .stdout(contains("started session"));

    assert!(dir.path().join(".blockspool").join("runs").is_dir());
}

#[test]
fn history_on_a_fresh_project_reports_an_empty_ledger() {
    let dir = tempdir().unwrap();
    blockspool()
        .args(["--project", dir.path().to_str().unwrap(), "solo", "history"])
        .assert()
        .success();
}

#[test]
fn trajectory_list_on_a_fresh_project_reports_no_trajectories() {
    let dir = tempdir().unwrap();
    blockspool()
        .args(["--project", dir.path().to_str().unwrap(), "trajectory", "list"])
        .assert()
        .success();
}

#[test]
fn unknown_subcommand_is_rejected_by_clap() {
    blockspool().args(["bogus"]).assert().failure();
}

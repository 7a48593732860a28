use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_help_lists_all_subcommands() {
    let mut cmd = Command::cargo_bin("grantflow").unwrap();

    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("threads"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("feedback"))
        .stdout(predicate::str::contains("validate-graph"));
}

#[test]
fn test_init_writes_config_and_refuses_overwrite() {
    let dir = TempDir::new().unwrap();

    let mut cmd = Command::cargo_bin("grantflow").unwrap();
    cmd.current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("grantflow.toml"));
    assert!(dir.path().join("grantflow.toml").exists());

    let mut cmd = Command::cargo_bin("grantflow").unwrap();
    cmd.current_dir(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
}

#[test]
fn test_validate_graph_prints_topological_order() {
    let dir = TempDir::new().unwrap();

    let mut cmd = Command::cargo_bin("grantflow").unwrap();
    cmd.current_dir(dir.path())
        .arg("validate-graph")
        .assert()
        .success()
        .stdout(predicate::str::contains("acyclic"))
        .stdout(predicate::str::contains("research"))
        .stdout(predicate::str::contains("budget_narrative"));
}

#[test]
fn test_status_for_unknown_thread_fails_with_message() {
    let dir = TempDir::new().unwrap();

    let mut cmd = Command::cargo_bin("grantflow").unwrap();
    cmd.current_dir(dir.path())
        .arg("status")
        .arg("--thread")
        .arg("no-such-thread")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no checkpoint exists"));
}

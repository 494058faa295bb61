use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn tiergate(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tiergate").unwrap();
    cmd.arg("--config")
        .arg(config_dir.path().join("config.toml"))
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("tiergate").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tiergate 0.1.0"));
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("tiergate").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Tiered rate limiting and weighted fair queuing",
        ));
}

#[test]
fn test_cli_simulate_free_tier() {
    let dir = TempDir::new().unwrap();
    tiergate(&dir)
        .args(["simulate", "--user", "alice", "--tier", "free", "--requests", "130"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"allowed\": 120"))
        .stdout(predicate::str::contains("\"denied\": 10"))
        .stdout(predicate::str::contains("\"retry_after_seconds\": 60"));
}

#[test]
fn test_cli_simulate_rejects_unknown_tier() {
    let dir = TempDir::new().unwrap();
    tiergate(&dir)
        .args(["simulate", "--tier", "platinum"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn test_cli_drain_interleaves_tiers() {
    let dir = TempDir::new().unwrap();
    tiergate(&dir)
        .arg("drain")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"order\""))
        .stdout(predicate::str::contains("\"free\""));
}

#[test]
fn test_cli_config_uses_file_overrides() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("config.toml"),
        "[rate_limit.tiers.free]\nrequests_per_window = 42\nburst_allowance = 7\n",
    )
    .unwrap();

    tiergate(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("requests_per_window = 42"));
}

#[test]
fn test_cli_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("config.toml"), "[logging]\nlevel = \"loud\"\n").unwrap();

    tiergate(&dir)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid log level"));
}

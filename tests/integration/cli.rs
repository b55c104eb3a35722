//! Command-line behavior of the daemon binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

#[allow(deprecated)]
fn vault_cmd() -> Command {
    Command::cargo_bin("evidence-vault").expect("Failed to find evidence-vault binary")
}

#[test]
fn test_help_lists_subcommands() {
    vault_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("check-config"));
}

#[test]
fn test_check_config_prints_effective_settings() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("vault.toml");
    fs::write(
        &config_path,
        r#"
[storage]
kind = "memory"

[upload]
max_file_size_mb = 7
"#,
    )
    .expect("Failed to write config");

    vault_cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("check-config")
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"kind\": \"memory\""))
        .stdout(predicate::str::contains("\"max_file_size_mb\": 7"));
}

#[test]
fn test_check_config_rejects_s3_without_bucket() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("vault.toml");
    fs::write(&config_path, "[storage]\nkind = \"s3\"\n").expect("Failed to write config");

    vault_cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("check-config")
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .failure()
        .stderr(predicate::str::contains("bucket"));
}

#[test]
fn test_missing_config_file_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    vault_cmd()
        .arg("--config")
        .arg(temp_dir.path().join("absent.toml"))
        .arg("check-config")
        .assert()
        .failure();
}

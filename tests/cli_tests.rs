//! CLI tests for autoship
//!
//! These exercise argument parsing, configuration handling and credential
//! checks. Nothing here talks to the network.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create an autoship Command in an isolated directory with no
/// credentials in the environment
fn autoship(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("autoship");
    cmd.current_dir(dir.path())
        .env_remove("GITHUB_TOKEN")
        .env_remove("OPENAI_API_KEY")
        .env_remove("AUTOSHIP_EXECUTION_MODE")
        .env_remove("RUST_LOG");
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        autoship(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("repos"))
            .stdout(predicate::str::contains("config"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        autoship(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("autoship"));
    }

    #[test]
    fn test_run_help_lists_options() {
        let dir = TempDir::new().unwrap();
        autoship(&dir)
            .args(["run", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--instruction"))
            .stdout(predicate::str::contains("--mode"))
            .stdout(predicate::str::contains("--test-timeout"))
            .stdout(predicate::str::contains("--branch-hint"));
    }

    #[test]
    fn test_run_requires_instruction() {
        let dir = TempDir::new().unwrap();
        autoship(&dir)
            .args(["run", "--repo", "octo/widgets"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--instruction"));
    }

    #[test]
    fn test_run_rejects_unknown_mode() {
        let dir = TempDir::new().unwrap();
        autoship(&dir)
            .args(["run", "-i", "rename foo", "--mode", "cloud"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid execution mode"));
    }
}

mod credentials {
    use super::*;

    #[test]
    fn test_run_without_hosting_token_fails() {
        let dir = TempDir::new().unwrap();
        autoship(&dir)
            .args(["run", "--repo", "octo/widgets", "-i", "rename foo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("GITHUB_TOKEN is not set"));
    }

    #[test]
    fn test_run_without_generation_key_fails() {
        let dir = TempDir::new().unwrap();
        autoship(&dir)
            .env("GITHUB_TOKEN", "ghp_not_a_real_token")
            .args(["run", "--repo", "octo/widgets", "-i", "rename foo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("OPENAI_API_KEY is not set"))
            .stderr(predicate::str::contains("ghp_not_a_real_token").not());
    }

    #[test]
    fn test_repos_without_token_fails() {
        let dir = TempDir::new().unwrap();
        autoship(&dir)
            .arg("repos")
            .assert()
            .failure()
            .stderr(predicate::str::contains("GITHUB_TOKEN"));
    }
}

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        autoship(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("(defaults)"))
            .stdout(predicate::str::contains("[session]"))
            .stdout(predicate::str::contains("retention_secs = 600"))
            .stdout(predicate::str::contains("model = \"gpt-4\""));
    }

    #[test]
    fn test_config_show_reads_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("autoship.toml"),
            "[session]\ndefault_test_timeout_secs = 42\n\n[sandbox]\nimage = \"python:3.12\"\n",
        )
        .unwrap();
        autoship(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("autoship.toml"))
            .stdout(predicate::str::contains("default_test_timeout_secs = 42"))
            .stdout(predicate::str::contains("image = \"python:3.12\""));
    }

    #[test]
    fn test_config_validate_ok() {
        let dir = TempDir::new().unwrap();
        autoship(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_validate_rejects_zero_timeout() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("autoship.toml"),
            "[session]\nprovision_timeout_secs = 0\n",
        )
        .unwrap();
        autoship(&dir)
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("provision_timeout_secs"));
    }

    #[test]
    fn test_config_validate_rejects_bad_toml() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("autoship.toml"), "[session\n").unwrap();
        autoship(&dir)
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("autoship.toml"));
    }

    #[test]
    fn test_explicit_missing_config_fails() {
        let dir = TempDir::new().unwrap();
        autoship(&dir)
            .args(["--config", "nope.toml", "config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("nope.toml"));
    }
}

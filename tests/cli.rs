//! Integration tests for the patchbox CLI.
//!
//! These tests verify binary behavior that needs no Docker daemon:
//! help output, flag parsing, and configuration validation. Sandbox
//! behavior against a live daemon lives in tests/env.rs.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

/// Creates a Command for the patchbox binary.
#[allow(deprecated)]
fn patchbox() -> Command {
    Command::cargo_bin("patchbox").expect("failed to find patchbox binary")
}

// -----------------------------------------------------------------------------
// Help and version tests
// -----------------------------------------------------------------------------

#[test]
fn test_help_shows_all_commands() {
    patchbox()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("patchbox"))
        .stdout(predicate::str::contains("shell"))
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("pr"))
        .stdout(predicate::str::contains("images"));
}

#[test]
fn test_version_shows_version() {
    patchbox()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("patchbox"));
}

#[test]
fn test_exec_help_shows_sandbox_flags() {
    patchbox()
        .args(["exec", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--timeout"))
        .stdout(predicate::str::contains("--data-path"))
        .stdout(predicate::str::contains("--repo-path"))
        .stdout(predicate::str::contains("--image"))
        .stdout(predicate::str::contains("--container-name"))
        .stdout(predicate::str::contains("--cache-task-images"))
        .stdout(predicate::str::contains("--env-setup"))
        .stdout(predicate::str::contains("--config"));
}

#[test]
fn test_pr_help_shows_publish_flags() {
    patchbox()
        .args(["pr", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--trajectory"));
}

#[test]
fn test_images_help_shows_actions() {
    patchbox()
        .args(["images", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("clean"))
        .stdout(predicate::str::contains("--image"));
}

// -----------------------------------------------------------------------------
// Configuration validation tests
// -----------------------------------------------------------------------------

#[test]
fn test_exec_requires_data_path() {
    patchbox()
        .args(["exec", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("data_path"));
}

#[test]
fn test_repo_path_required_for_file_tasks() {
    patchbox()
        .args(["exec", "--data-path", "/tasks/bug.md", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("repo_path"));
}

#[test]
fn test_cache_with_persistent_container_rejected() {
    patchbox()
        .args([
            "exec",
            "--data-path",
            "/tasks/bug.md",
            "--repo-path",
            "/work/repo",
            "--cache-task-images",
            "--container-name",
            "box",
            "true",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not allowed"));
}

#[test]
fn test_missing_config_file_reported() {
    patchbox()
        .args(["exec", "--config", "/nonexistent/patchbox.toml", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}

#[test]
fn test_malformed_config_file_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("patchbox.toml");
    fs::write(&path, "data_path = [not toml").unwrap();

    patchbox()
        .args(["exec", "--config", path.to_str().unwrap(), "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse"));
}

#[test]
fn test_invalid_communicate_method_override_rejected() {
    patchbox()
        .env("PATCHBOX_COMMUNICATE_METHOD", "bogus")
        .args([
            "exec",
            "--data-path",
            "/tasks/bug.md",
            "--repo-path",
            "/work/repo",
            "true",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("communicate method"));
}

// -----------------------------------------------------------------------------
// Publish command tests (no daemon interaction)
// -----------------------------------------------------------------------------

#[test]
fn test_pr_without_container_name_explains_attach() {
    patchbox()
        .args([
            "pr",
            "--dry-run",
            "--data-path",
            "/tasks/bug.md",
            "--repo-path",
            "/work/repo",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("container_name"));
}

#[test]
fn test_pr_missing_trajectory_file_reported() {
    patchbox()
        .args([
            "pr",
            "--dry-run",
            "--trajectory",
            "/nonexistent/run.json",
            "--data-path",
            "/tasks/bug.md",
            "--repo-path",
            "/work/repo",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("trajectory"));
}

// -----------------------------------------------------------------------------
// Error message tests
// -----------------------------------------------------------------------------

#[test]
fn test_unknown_command_suggests_help() {
    patchbox()
        .arg("unknown")
        .assert()
        .failure()
        .stderr(predicate::str::contains("help"));
}

#[test]
fn test_images_requires_action() {
    patchbox().arg("images").assert().failure();
}

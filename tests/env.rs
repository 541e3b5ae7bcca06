//! Docker-backed integration tests.
//!
//! Every test here is `#[ignore]`-gated: run them explicitly with
//! `cargo test --test env -- --ignored` against a live Docker daemon.
//! First use pulls `python:3.11` (git + bash + python) and, for the
//! from-scratch install test, `buildpack-deps:jammy` (git + bash, no
//! python). Containers and cached images are created with unique names
//! and cleaned up on the way out.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use patchbox::config::{CommunicateMethod, EnvConfig};
use patchbox::env::{EnvState, Resolution, TaskEnv};
use patchbox::hooks::EnvHook;
use patchbox::install::InstallOutcome;
use patchbox::runtime::DockerRuntime;
use patchbox::trajectory::Trajectory;
use tempfile::TempDir;
use uuid::Uuid;

const IMAGE: &str = "python:3.11";
const BARE_IMAGE: &str = "buildpack-deps:jammy";
const TIMEOUT: Duration = Duration::from_secs(60);

fn unique(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..8])
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .status()
        .expect("git not available on the host");
    assert!(status.success(), "git {args:?} failed");
}

/// A throwaway git repository with one committed file and a GitHub
/// origin remote (never pushed to; publishing tests stay dry-run).
fn fixture_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let repo = dir.path().join("widgets");
    std::fs::create_dir(&repo).unwrap();
    std::fs::write(repo.join("README.md"), "# widgets\n").unwrap();
    git(&repo, &["init", "-q"]);
    git(&repo, &["config", "user.email", "test@localhost"]);
    git(&repo, &["config", "user.name", "test"]);
    git(&repo, &["add", "-A"]);
    git(&repo, &["commit", "-qm", "initial"]);
    git(
        &repo,
        &["remote", "add", "origin", "https://github.com/octo/widgets.git"],
    );
    (dir, repo)
}

fn config_for(repo: &Path) -> EnvConfig {
    let mut config = EnvConfig::new("/tasks/bug.md", repo.to_str().unwrap());
    config.image_name = IMAGE.to_string();
    config
}

// -----------------------------------------------------------------------------
// Lifecycle
// -----------------------------------------------------------------------------

#[tokio::test]
#[ignore]
async fn test_ephemeral_reset_execute_close() {
    let (_guard, repo) = fixture_repo();
    let env = TaskEnv::new(config_for(&repo)).unwrap();

    env.reset().await.unwrap();
    assert_eq!(env.state(), EnvState::Ready);
    assert_eq!(env.resolution().await, Some(Resolution::Created));
    assert_eq!(env.last_install_outcome(), Some(InstallOutcome::Skipped));
    assert_eq!(env.cached_image_prefix(), None);

    let ls = env.execute("ls", TIMEOUT).await.unwrap();
    assert!(ls.success());
    assert!(ls.output.contains("README.md"));

    let pwd = env.execute("pwd", TIMEOUT).await.unwrap();
    assert_eq!(pwd.output.trim(), "/widgets");

    env.close().await.unwrap();
    assert_eq!(env.state(), EnvState::Closed);
}

#[tokio::test]
#[ignore]
async fn test_persistent_reattach_preserves_files_outside_the_repo() {
    let (_guard, repo) = fixture_repo();
    let name = unique("patchbox-test");
    let mut config = config_for(&repo);
    config.container_name = Some(name.clone());

    let env = TaskEnv::new(config.clone()).unwrap();
    env.reset().await.unwrap();
    assert!(env
        .execute("touch /root/marker-file", TIMEOUT)
        .await
        .unwrap()
        .success());
    assert!(env
        .execute("touch /widgets/scratch.txt", TIMEOUT)
        .await
        .unwrap()
        .success());
    env.close().await.unwrap();

    // A second environment restarts the stopped container and attaches.
    let env = TaskEnv::new(config).unwrap();
    env.reset().await.unwrap();
    assert_eq!(env.resolution().await, Some(Resolution::Attached));
    assert_eq!(env.last_install_outcome(), Some(InstallOutcome::UpToDate));

    // Files outside the repo survive; the repo itself is reset.
    assert!(env
        .execute("test -f /root/marker-file", TIMEOUT)
        .await
        .unwrap()
        .success());
    assert!(!env
        .execute("test -f /widgets/scratch.txt", TIMEOUT)
        .await
        .unwrap()
        .success());

    env.close().await.unwrap();
    DockerRuntime::connect().unwrap().remove(&name).await.ok();
}

// -----------------------------------------------------------------------------
// Installation and caching
// -----------------------------------------------------------------------------

#[tokio::test]
#[ignore]
async fn test_setup_script_runs_during_reset() {
    let (_guard, repo) = fixture_repo();
    let script_dir = TempDir::new().unwrap();
    let script = script_dir.path().join("setup.sh");
    std::fs::write(&script, "#!/bin/bash\necho from-script > /root/installed\n").unwrap();

    let mut config = config_for(&repo);
    config.environment_setup = Some(script);

    let env = TaskEnv::new(config).unwrap();
    env.reset().await.unwrap();
    assert_eq!(env.last_install_outcome(), Some(InstallOutcome::Script));

    let check = env.execute("cat /root/installed", TIMEOUT).await.unwrap();
    assert_eq!(check.output.trim(), "from-script");

    env.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_cached_image_makes_second_reset_faster() {
    let (_guard, repo) = fixture_repo();
    let script_dir = TempDir::new().unwrap();
    let script = script_dir.path().join("setup.sh");
    std::fs::write(&script, "#!/bin/bash\nsleep 3\necho done > /root/installed\n").unwrap();

    let mut config = config_for(&repo);
    config.cache_task_images = true;
    config.environment_setup = Some(script);

    let env = TaskEnv::new(config.clone()).unwrap();
    let started = Instant::now();
    env.reset().await.unwrap();
    let first = started.elapsed();
    assert_eq!(env.last_install_outcome(), Some(InstallOutcome::Script));
    let prefix = env.cached_image_prefix().expect("prefix after cached build");
    assert!(!prefix.is_empty());
    env.close().await.unwrap();

    let env = TaskEnv::new(config).unwrap();
    let started = Instant::now();
    env.reset().await.unwrap();
    let second = started.elapsed();
    assert!(matches!(
        env.last_install_outcome(),
        Some(InstallOutcome::Restored { .. })
    ));
    assert!(second < first, "restore took {second:?}, install took {first:?}");

    // Installed state came along with the image.
    let check = env.execute("cat /root/installed", TIMEOUT).await.unwrap();
    assert_eq!(check.output.trim(), "done");
    env.close().await.unwrap();

    let runtime = DockerRuntime::connect().unwrap();
    for tag in runtime.list_images_with_prefix(&prefix).await.unwrap() {
        runtime.remove_image(&tag).await.ok();
    }
}

#[tokio::test]
#[ignore]
async fn test_manifest_clones_existing_interpreter() {
    let (_guard, repo) = fixture_repo();
    let manifest_dir = TempDir::new().unwrap();
    let manifest = manifest_dir.path().join("env.yaml");
    std::fs::write(&manifest, "interpreter: \"3.11\"\n").unwrap();

    let mut config = config_for(&repo);
    config.environment_setup = Some(manifest);

    let env = TaskEnv::new(config).unwrap();
    env.reset().await.unwrap();
    assert_eq!(
        env.last_install_outcome(),
        Some(InstallOutcome::Cloned {
            interpreter: "3.11".to_string()
        })
    );

    // The task venv is on PATH for subsequent commands.
    let which = env.execute("command -v python", TIMEOUT).await.unwrap();
    assert_eq!(which.output.trim(), "/root/venvs/task/bin/python");

    env.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_manifest_builds_missing_interpreter() {
    let (_guard, repo) = fixture_repo();
    let manifest_dir = TempDir::new().unwrap();
    let manifest = manifest_dir.path().join("env.yaml");
    std::fs::write(&manifest, "interpreter: \"3.10\"\n").unwrap();

    let mut config = config_for(&repo);
    config.image_name = BARE_IMAGE.to_string();
    config.environment_setup = Some(manifest);

    let env = TaskEnv::new(config).unwrap();
    env.reset().await.unwrap();
    assert_eq!(
        env.last_install_outcome(),
        Some(InstallOutcome::Built {
            interpreter: Some("3.10".to_string())
        })
    );

    let version = env.execute("python3.10 --version", TIMEOUT).await.unwrap();
    assert!(version.output.contains("3.10"));

    env.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Command channel behavior
// -----------------------------------------------------------------------------

#[tokio::test]
#[ignore]
async fn test_shell_state_carries_across_commands() {
    let (_guard, repo) = fixture_repo();
    let env = TaskEnv::new(config_for(&repo)).unwrap();
    env.reset().await.unwrap();

    assert!(env
        .execute("cd /tmp && export MARKER=42", TIMEOUT)
        .await
        .unwrap()
        .success());
    let out = env.execute("echo $MARKER $(pwd)", TIMEOUT).await.unwrap();
    assert_eq!(out.output.trim(), "42 /tmp");

    env.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_process_strategy_does_not_carry_state() {
    let (_guard, repo) = fixture_repo();
    let mut config = config_for(&repo);
    config.communicate_method = CommunicateMethod::Process;

    let env = TaskEnv::new(config).unwrap();
    env.reset().await.unwrap();

    let before = env.execute("pwd", TIMEOUT).await.unwrap();
    assert_eq!(before.output.trim(), "/widgets");

    assert!(env.execute("cd /tmp", TIMEOUT).await.unwrap().success());
    let after = env.execute("pwd", TIMEOUT).await.unwrap();
    assert_eq!(after.output.trim(), "/widgets");

    env.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_interrupt_unblocks_a_running_command() {
    let (_guard, repo) = fixture_repo();
    let env = Arc::new(TaskEnv::new(config_for(&repo)).unwrap());
    env.reset().await.unwrap();

    let runner = Arc::clone(&env);
    let handle =
        tokio::spawn(async move { runner.execute("sleep 600", Duration::from_secs(590)).await });

    tokio::time::sleep(Duration::from_secs(2)).await;
    env.interrupt().await.unwrap();

    let result = handle.await.unwrap().unwrap();
    assert!(!result.success(), "killed command should exit non-zero");

    // The channel survived the interrupt.
    let after = env.execute("echo alive", TIMEOUT).await.unwrap();
    assert_eq!(after.output.trim(), "alive");

    env.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_timeout_is_recoverable() {
    let (_guard, repo) = fixture_repo();
    let env = TaskEnv::new(config_for(&repo)).unwrap();
    env.reset().await.unwrap();

    let err = env
        .execute("sleep 30", Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(env.state(), EnvState::Ready);

    let after = env.execute("echo recovered", TIMEOUT).await.unwrap();
    assert_eq!(after.output.trim(), "recovered");

    env.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Publishing
// -----------------------------------------------------------------------------

#[tokio::test]
#[ignore]
async fn test_dry_run_pr_without_changes_reports_no_changes() {
    let (_guard, repo) = fixture_repo();
    let env = TaskEnv::new(config_for(&repo)).unwrap();
    env.reset().await.unwrap();

    let err = env.open_pr(true, &Trajectory::new()).await.unwrap_err();
    assert!(err.is_no_changes());

    env.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_dry_run_pr_branches_and_commits_without_pushing() {
    let (_guard, repo) = fixture_repo();
    let mut config = config_for(&repo);
    config.data_path = "https://github.com/octo/widgets/issues/7".to_string();

    let env = TaskEnv::new(config).unwrap();
    env.reset().await.unwrap();
    assert!(env
        .execute("echo change >> /widgets/README.md", TIMEOUT)
        .await
        .unwrap()
        .success());

    let mut trajectory = Trajectory::new();
    trajectory.record("echo change >> README.md", "");
    let url = env.open_pr(true, &trajectory).await.unwrap();
    assert!(url.is_none(), "dry run must not open a pull request");

    let branch = env
        .execute("git -C /widgets branch --show-current", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(branch.output.trim(), "patchbox-fix-7");

    let log = env
        .execute("git -C /widgets log -1 --format=%s", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(log.output.trim(), "Fix #7");

    env.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Hooks
// -----------------------------------------------------------------------------

struct CountingHook {
    events: Arc<Mutex<Vec<String>>>,
}

impl EnvHook for CountingHook {
    fn name(&self) -> &str {
        "counting"
    }

    fn on_init(&mut self) -> anyhow::Result<()> {
        self.events.lock().unwrap().push("init".to_string());
        Ok(())
    }

    fn on_reset_start(&mut self) -> anyhow::Result<()> {
        self.events.lock().unwrap().push("reset_start".to_string());
        Ok(())
    }

    fn on_reset_complete(&mut self) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push("reset_complete".to_string());
        Ok(())
    }

    fn on_close(&mut self) -> anyhow::Result<()> {
        self.events.lock().unwrap().push("close".to_string());
        Ok(())
    }
}

#[tokio::test]
#[ignore]
async fn test_hooks_observe_the_whole_lifecycle() {
    let (_guard, repo) = fixture_repo();
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut env = TaskEnv::new(config_for(&repo)).unwrap();
    env.add_hook(Box::new(CountingHook {
        events: Arc::clone(&events),
    }))
    .unwrap();

    env.reset().await.unwrap();
    env.close().await.unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        ["init", "reset_start", "reset_complete", "close"]
    );
}

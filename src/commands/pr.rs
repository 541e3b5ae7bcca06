//! Publish the sandbox's diff as a pull request.
//!
//! Unlike `exec` and `shell`, this command never resets the
//! environment: resetting would restore the repository to the base
//! commit and wipe the changes being published. It attaches to the
//! persistent container as-is.

use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::warn;

use crate::config::EnvConfig;
use crate::env::TaskEnv;
use crate::trajectory::Trajectory;

/// Entry point: attach and publish.
pub async fn run(config: EnvConfig, dry_run: bool, trajectory_path: Option<PathBuf>) -> Result<()> {
    let trajectory = match &trajectory_path {
        Some(path) => Trajectory::load(path)?,
        None => Trajectory::new(),
    };

    let env = TaskEnv::new(config).context("Failed to initialize task environment")?;
    let result = env.open_pr(dry_run, &trajectory).await;
    if let Err(e) = env.close().await {
        warn!("Failed to close task environment: {e}");
    }

    match result.context("Failed to publish pull request")? {
        Some(url) => println!("{} Opened pull request: {}", "✓".green(), url.bold()),
        None => println!("{} Dry run complete, no pull request opened.", "ℹ".blue()),
    }
    Ok(())
}

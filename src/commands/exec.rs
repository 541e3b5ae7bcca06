//! One-shot command execution.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use crate::config::EnvConfig;
use crate::env::TaskEnv;

/// Entry point: reset, run one command, close. The process exits with
/// the command's exit code.
pub async fn run(config: EnvConfig, command: String, timeout_secs: u64) -> Result<()> {
    let env = TaskEnv::new(config).context("Failed to initialize task environment")?;
    env.reset().await.context("Failed to reset task environment")?;

    let result = env
        .execute(&command, Duration::from_secs(timeout_secs))
        .await;
    if let Err(e) = env.close().await {
        warn!("Failed to close task environment: {e}");
    }
    let output = result.context("Command failed")?;

    if !output.output.is_empty() {
        print!("{}", output.output);
        if !output.output.ends_with('\n') {
            println!();
        }
    }
    if !output.success() {
        std::process::exit(i32::try_from(output.exit_code).unwrap_or(1));
    }
    Ok(())
}

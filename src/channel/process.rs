//! Per-command exec channel.
//!
//! The opt-in legacy strategy: every command is an independent
//! `docker exec /bin/bash -c <command>`. Nothing carries over between
//! calls — no cwd changes, no exports — so each exec sets the repo
//! directory as its working dir and reads the shared environment file
//! through `BASH_ENV`.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{truncate_for_log, CommandChannel, ExecOutput, ENV_FILE};
use crate::error::{EnvError, Phase, Result};
use crate::runtime::DockerRuntime;

/// Stateless channel running one exec per command.
pub struct ProcessChannel {
    runtime: DockerRuntime,
    container_id: String,
    working_dir: String,
    parent_pids: Vec<u32>,
}

impl ProcessChannel {
    /// Creates a channel that runs commands in `working_dir`.
    pub fn new(runtime: DockerRuntime, container_id: &str, working_dir: &str) -> Self {
        Self {
            runtime,
            container_id: container_id.to_string(),
            working_dir: working_dir.to_string(),
            parent_pids: vec![1],
        }
    }
}

#[async_trait]
impl CommandChannel for ProcessChannel {
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        if command.trim().is_empty() {
            return Ok(ExecOutput::default());
        }

        debug!("exec <- {}", truncate_for_log(command));
        let result = self
            .runtime
            .exec_collect(
                &self.container_id,
                vec![
                    "/bin/bash".to_string(),
                    "-c".to_string(),
                    command.to_string(),
                ],
                vec![format!("BASH_ENV={ENV_FILE}")],
                Some(self.working_dir.clone()),
                timeout,
                Phase::Execute,
            )
            .await;

        match result {
            Err(e) if e.is_timeout() => {
                // The exec's processes keep running server-side after the
                // stream is abandoned; kill them before reporting.
                if let Err(kill_err) = self
                    .runtime
                    .kill_except(&self.container_id, &self.parent_pids)
                    .await
                {
                    return Err(EnvError::sandbox_unavailable(
                        Phase::Execute,
                        format!("failed to kill timed-out command: {kill_err}"),
                    ));
                }
                Err(e)
            }
            other => other,
        }
    }

    async fn close(&mut self) {}

    fn parent_pids(&self) -> &[u32] {
        &self.parent_pids
    }
}

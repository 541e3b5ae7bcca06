//! Command delivery into the sandbox.
//!
//! Two strategies implement the same seam: [`ShellChannel`] keeps one
//! bash alive for the life of the sandbox so state (cwd, exports,
//! activated environments) carries across commands; [`ProcessChannel`]
//! runs every command as an independent exec. The lifecycle manager
//! picks one per the configured communicate method.

mod process;
mod shell;

pub use process::ProcessChannel;
pub use shell::ShellChannel;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// File sourced into every command's shell. Installer activations are
/// appended here so both channel strategies observe them.
pub const ENV_FILE: &str = "/root/.patchbox-env";

/// Output of one command run inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Interleaved stdout/stderr text.
    pub output: String,
    /// Exit code the command finished with.
    pub exit_code: i64,
}

impl ExecOutput {
    /// True when the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A channel that delivers commands into a sandbox.
///
/// One command is in flight at a time; `execute` borrows the channel
/// mutably for the duration. Commands that read stdin are outside the
/// protocol: the channel never forwards input to them.
#[async_trait]
pub trait CommandChannel: Send {
    /// Runs one command to completion, bounded by `timeout`.
    ///
    /// A blank command is a no-op returning empty output and exit 0.
    /// Timeouts kill the in-flight processes and surface as a matchable
    /// error with the channel still usable.
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput>;

    /// Best-effort shutdown. Never fails.
    async fn close(&mut self);

    /// PIDs that must survive an interrupt: the container's init process
    /// and, for the shell strategy, the shell itself.
    fn parent_pids(&self) -> &[u32];
}

pub(crate) fn truncate_for_log(s: &str) -> String {
    const MAX: usize = 120;
    if s.chars().count() <= MAX {
        s.to_string()
    } else {
        let head: String = s.chars().take(MAX).collect();
        format!("{head}...")
    }
}

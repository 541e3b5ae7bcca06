//! Persistent-shell command channel.
//!
//! One `/bin/bash --norc --noprofile` exec runs for the life of the
//! sandbox. Each command is written to its stdin followed by a sentinel
//! line carrying the exit code; scanning the output stream for the
//! sentinel tells us where the command's output ends without a TTY or
//! prompt detection. Markers are randomized per call, and regenerated if
//! the command text happens to contain the candidate.

use async_trait::async_trait;
use bollard::container::LogOutput;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{truncate_for_log, CommandChannel, ExecOutput, ENV_FILE};
use crate::error::{EnvError, Phase, Result};
use crate::runtime::{DockerRuntime, ShellExec};

const MARKER_PREFIX: &str = "___PATCHBOX_";
const MARKER_SUFFIX: &str = "___";

/// How long after killing a timed-out command we keep draining for the
/// pending sentinel before declaring the shell lost.
const RECOVERY_WINDOW: Duration = Duration::from_secs(5);

/// Long-lived shell inside the sandbox container.
pub struct ShellChannel {
    runtime: DockerRuntime,
    container_id: String,
    shell: ShellExec,
    parent_pids: Vec<u32>,
    /// Bytes read from the stream but not yet attributed to a command.
    /// Output a backgrounded job prints between commands lands here and
    /// is attributed to the next command.
    buffer: Vec<u8>,
}

impl ShellChannel {
    /// Starts the shell exec and bootstraps the session: learns the
    /// shell's PID and sources the environment file.
    pub async fn open(runtime: DockerRuntime, container_id: &str) -> Result<Self> {
        let shell = runtime
            .start_shell_exec(
                container_id,
                vec![
                    "/bin/bash".to_string(),
                    "--norc".to_string(),
                    "--noprofile".to_string(),
                ],
            )
            .await?;

        let mut channel = Self {
            runtime,
            container_id: container_id.to_string(),
            shell,
            parent_pids: vec![1],
            buffer: Vec::new(),
        };

        // An interrupt kills everything outside the parent set, so the
        // shell must be in it before any real command runs.
        let pid = channel.execute("echo $$", Duration::from_secs(10)).await?;
        match pid.output.trim().parse::<u32>() {
            Ok(shell_pid) => channel.parent_pids.push(shell_pid),
            Err(_) => warn!("could not determine shell PID from {:?}", pid.output.trim()),
        }

        channel
            .execute(
                &format!("source {ENV_FILE} 2>/dev/null || true"),
                Duration::from_secs(10),
            )
            .await?;

        Ok(channel)
    }

    async fn read_until_marker(&mut self, marker: &str, timeout: Duration) -> Result<ExecOutput> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some((output, exit_code)) = scan_buffer(&mut self.buffer, marker.as_bytes()) {
                debug!("shell -> {} bytes, exit {exit_code}", output.len());
                return Ok(ExecOutput { output, exit_code });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.recover_from_timeout(marker, timeout).await;
            }

            match tokio::time::timeout(remaining, self.shell.output.next()).await {
                Err(_) => return self.recover_from_timeout(marker, timeout).await,
                Ok(None) => {
                    return Err(EnvError::sandbox_unavailable(
                        Phase::Execute,
                        "shell exec stream closed unexpectedly",
                    ))
                }
                Ok(Some(Ok(chunk))) => self.absorb(chunk),
                Ok(Some(Err(e))) => {
                    return Err(EnvError::docker(
                        Phase::Execute,
                        format!("error reading shell output: {e}"),
                    ))
                }
            }
        }
    }

    fn absorb(&mut self, chunk: LogOutput) {
        match chunk {
            LogOutput::StdOut { message }
            | LogOutput::StdErr { message }
            | LogOutput::Console { message } => {
                self.buffer.extend_from_slice(&message);
            }
            LogOutput::StdIn { .. } => {}
        }
    }

    /// Kills the runaway command, then drains for the sentinel the shell
    /// prints once it regains the foreground. Finding it means the shell
    /// survived and the channel stays usable; not finding it means the
    /// sandbox is gone.
    async fn recover_from_timeout(&mut self, marker: &str, timeout: Duration) -> Result<ExecOutput> {
        warn!(
            "Command timed out after {}s, killing in-flight processes",
            timeout.as_secs()
        );

        if let Err(e) = self
            .runtime
            .kill_except(&self.container_id, &self.parent_pids)
            .await
        {
            return Err(EnvError::sandbox_unavailable(
                Phase::Execute,
                format!("failed to kill timed-out command: {e}"),
            ));
        }

        let deadline = Instant::now() + RECOVERY_WINDOW;
        loop {
            if scan_buffer(&mut self.buffer, marker.as_bytes()).is_some() {
                return Err(EnvError::timeout(timeout));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.shell.output.next()).await {
                Ok(Some(Ok(chunk))) => self.absorb(chunk),
                _ => break,
            }
        }

        Err(EnvError::sandbox_unavailable(
            Phase::Execute,
            format!(
                "shell did not recover within {}s after killing a timed-out command",
                RECOVERY_WINDOW.as_secs()
            ),
        ))
    }
}

#[async_trait]
impl CommandChannel for ShellChannel {
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        if command.trim().is_empty() {
            return Ok(ExecOutput::default());
        }

        let marker = fresh_marker(command);
        let payload = format!("{command}\nprintf '%s %s\\n' '{marker}' \"$?\"\n");

        debug!("shell <- {}", truncate_for_log(command));
        self.shell
            .input
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| {
                EnvError::sandbox_unavailable(Phase::Execute, format!("failed to write to shell: {e}"))
            })?;
        self.shell.input.flush().await.map_err(|e| {
            EnvError::sandbox_unavailable(Phase::Execute, format!("failed to flush shell input: {e}"))
        })?;

        self.read_until_marker(&marker, timeout).await
    }

    async fn close(&mut self) {
        let _ = self.shell.input.write_all(b"exit\n").await;
        let _ = self.shell.input.flush().await;
    }

    fn parent_pids(&self) -> &[u32] {
        &self.parent_pids
    }
}

/// Picks a marker that does not occur in the command text.
fn fresh_marker(command: &str) -> String {
    loop {
        let marker = format!("{MARKER_PREFIX}{}{MARKER_SUFFIX}", Uuid::new_v4().simple());
        if !command.contains(&marker) {
            return marker;
        }
    }
}

/// Scans for `<marker> <code>\n` in the buffer. On a hit, returns the
/// output bytes preceding the marker and the exit code, and consumes
/// everything through the sentinel line. Returns `None` while the
/// sentinel is absent or still incomplete.
fn scan_buffer(buffer: &mut Vec<u8>, marker: &[u8]) -> Option<(String, i64)> {
    let start = find_subslice(buffer, marker)?;
    let after = start + marker.len();
    let rest = &buffer[after..];

    // The sentinel is `<marker> <code>\n`; anything else is a partial
    // read, so wait for more bytes.
    if rest.first() != Some(&b' ') {
        return None;
    }
    let newline = rest.iter().position(|&b| b == b'\n')?;

    let exit_code = std::str::from_utf8(&rest[1..newline])
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .unwrap_or(-1);
    let output = String::from_utf8_lossy(&buffer[..start]).into_owned();

    buffer.drain(..after + newline + 1);
    Some((output, exit_code))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

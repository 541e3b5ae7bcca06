//! Interactive sandbox shell.
//!
//! Resets the environment, then reads command lines from stdin and runs
//! them through the channel. Ctrl-C interrupts the in-flight command
//! instead of killing the CLI; the interrupted command still completes
//! through the channel with the killed process's exit code.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

use crate::channel::ExecOutput;
use crate::config::EnvConfig;
use crate::env::TaskEnv;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Entry point: interactive shell against a fresh sandbox.
pub async fn run(config: EnvConfig) -> Result<()> {
    let env = TaskEnv::new(config).context("Failed to initialize task environment")?;
    env.reset().await.context("Failed to reset task environment")?;

    println!(
        "{} Sandbox ready. Type commands, {} to leave.",
        "✓".green(),
        "exit".bold()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", "patchbox>".cyan().bold());
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await.context("Failed to read input")? else {
            break;
        };
        let command = line.trim();
        if command == "exit" {
            break;
        }
        if command.is_empty() {
            continue;
        }

        let execute = env.execute(command, COMMAND_TIMEOUT);
        tokio::pin!(execute);
        let result = loop {
            tokio::select! {
                result = &mut execute => break result,
                _ = signal::ctrl_c() => {
                    println!();
                    if let Err(e) = env.interrupt().await {
                        eprintln!("{} Interrupt failed: {e}", "✗".red());
                    }
                }
            }
        };

        match result {
            Ok(output) => print_output(&output),
            Err(e) if e.is_timeout() => {
                println!("{} {e}", "⏱".yellow());
            }
            Err(e) => {
                let _ = env.close().await;
                return Err(e).context("Command failed");
            }
        }
    }

    env.close()
        .await
        .context("Failed to close task environment")?;
    Ok(())
}

fn print_output(output: &ExecOutput) {
    if !output.output.is_empty() {
        print!("{}", output.output);
        if !output.output.ends_with('\n') {
            println!();
        }
    }
    if !output.success() {
        println!("{}", format!("[exit {}]", output.exit_code).red());
    }
}

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use patchbox::commands;
use patchbox::config::EnvConfig;

#[derive(Parser)]
#[command(name = "patchbox")]
#[command(
    author,
    version,
    about = "Reproducible Docker task environments for patch-producing agents"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Flags shared by every sandbox-facing subcommand, mirroring the
/// config file surface. Flags win over the file.
#[derive(Args, Debug, Clone)]
struct EnvArgs {
    /// Task source: a problem statement file or a GitHub issue URL
    #[arg(long)]
    data_path: Option<String>,

    /// Local repository to copy into the sandbox
    #[arg(long)]
    repo_path: Option<String>,

    /// Base Docker image
    #[arg(long, env = "PATCHBOX_IMAGE")]
    image: Option<String>,

    /// Reuse a persistent named container instead of an ephemeral one
    #[arg(long)]
    container_name: Option<String>,

    /// Commit installed environments to per-task cached images
    #[arg(long)]
    cache_task_images: bool,

    /// Environment setup: a .sh script or a .yaml/.yml manifest
    #[arg(long)]
    env_setup: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

impl EnvArgs {
    fn into_config(self, verbose: bool) -> Result<EnvConfig> {
        let mut config = match &self.config {
            Some(path) => EnvConfig::load(path)?,
            None => {
                let mut config = EnvConfig::default();
                config.apply_env_overrides()?;
                config
            }
        };

        if let Some(data_path) = self.data_path {
            config.data_path = data_path;
        }
        if let Some(repo_path) = self.repo_path {
            config.repo_path = repo_path;
        }
        if let Some(image) = self.image {
            config.image_name = image;
        }
        if let Some(container_name) = self.container_name {
            config.container_name = Some(container_name);
        }
        if self.cache_task_images {
            config.cache_task_images = true;
        }
        if let Some(env_setup) = self.env_setup {
            config.environment_setup = Some(env_setup);
        }
        config.verbose = verbose;

        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive shell inside a fresh sandbox
    Shell {
        #[command(flatten)]
        env: EnvArgs,
    },

    /// Run one command inside a fresh sandbox
    Exec {
        /// Command to run
        command: String,

        /// Per-command timeout in seconds
        #[arg(short, long, default_value = "300")]
        timeout: u64,

        #[command(flatten)]
        env: EnvArgs,
    },

    /// Open a pull request from the sandbox's current changes
    Pr {
        /// Stop before pushing or calling the GitHub API
        #[arg(long)]
        dry_run: bool,

        /// Recorded trajectory JSON to render into the PR body
        #[arg(long)]
        trajectory: Option<PathBuf>,

        #[command(flatten)]
        env: EnvArgs,
    },

    /// Manage cached task images
    Images {
        #[command(subcommand)]
        action: commands::images::ImagesAction,

        /// Base Docker image the cached images were built from
        #[arg(long, env = "PATCHBOX_IMAGE", default_value = "patchbox/base:latest")]
        image: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("patchbox=debug")
    } else {
        EnvFilter::new("patchbox=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Shell { env } => {
            commands::shell::run(env.into_config(cli.verbose)?).await?;
        }
        Commands::Exec {
            command,
            timeout,
            env,
        } => {
            commands::exec::run(env.into_config(cli.verbose)?, command, timeout).await?;
        }
        Commands::Pr {
            dry_run,
            trajectory,
            env,
        } => {
            commands::pr::run(env.into_config(cli.verbose)?, dry_run, trajectory).await?;
        }
        Commands::Images { action, image } => {
            commands::images::run(action, image).await?;
        }
    }

    Ok(())
}

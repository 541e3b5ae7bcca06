//! Cached task image management.
//!
//! Task environments installed under `cache_task_images` are committed
//! as images named `patchbox-task-env-<base image>-<fingerprint>`. This
//! command enumerates and garbage-collects them by that prefix.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use crate::install;
use crate::runtime::DockerRuntime;

/// Cached-image actions.
#[derive(Subcommand, Debug)]
pub enum ImagesAction {
    /// List cached task images for the base image
    List,
    /// Remove all cached task images for the base image
    Clean,
}

/// Entry point: list or clean cached task images.
pub async fn run(action: ImagesAction, image: String) -> Result<()> {
    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    runtime.ping().await?;

    let prefix = install::cached_image_prefix(&image);
    let images = runtime.list_images_with_prefix(&prefix).await?;

    match action {
        ImagesAction::List => {
            if images.is_empty() {
                println!("{} No cached task images for {}.", "ℹ".blue(), image.bold());
            } else {
                println!("Cached task images for {}:", image.bold());
                for tag in &images {
                    println!("  {tag}");
                }
            }
        }
        ImagesAction::Clean => {
            if images.is_empty() {
                println!("{} No cached task images for {}.", "ℹ".blue(), image.bold());
                return Ok(());
            }
            for tag in &images {
                runtime.remove_image(tag).await?;
                println!("  {} {}", "✗".red(), tag.dimmed());
            }
            println!("{} Removed {} cached image(s).", "✓".green(), images.len());
        }
    }
    Ok(())
}

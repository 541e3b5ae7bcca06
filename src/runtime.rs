//! Thin seam over the Docker daemon.
//!
//! Everything the lifecycle manager and the command channels need from
//! Docker goes through [`DockerRuntime`]: container resolution, execs,
//! archive uploads, image commits. Errors are mapped to
//! [`EnvError::Docker`] with the lifecycle phase they occurred in, so
//! callers never see raw bollard errors.

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CommitContainerOptions, CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::ContainerStateStatusEnum;
use bollard::Docker;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use crate::channel::ExecOutput;
use crate::error::{EnvError, Phase, Result};

/// Identity of a resolved sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    /// Docker container id.
    pub id: String,
    /// Docker container name.
    pub name: String,
}

/// Point-in-time status of a named container.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    /// Docker container id.
    pub id: String,
    /// Whether the container is currently running.
    pub running: bool,
    /// False when the container is dead or stuck mid-removal.
    pub healthy: bool,
}

/// An exec with attached stdin and output, backing the persistent shell.
pub struct ShellExec {
    /// Exec id, for later inspection.
    pub id: String,
    /// Write half: bytes sent here reach the shell's stdin.
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    /// Read half: interleaved stdout/stderr frames.
    pub output: Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, BollardError>> + Send>>,
}

/// Handle to the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local daemon. No I/O happens until the first call.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            EnvError::sandbox_unavailable(
                Phase::Resolve,
                format!("failed to connect to Docker ({e}). Is Docker running?"),
            )
        })?;
        Ok(Self { docker })
    }

    /// Pings the daemon.
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(|e| {
            EnvError::sandbox_unavailable(
                Phase::Resolve,
                format!("cannot ping Docker daemon ({e}). Is Docker running?"),
            )
        })?;
        Ok(())
    }

    /// Looks up a container by name. `None` when no such container.
    pub async fn inspect(&self, name: &str) -> Result<Option<ContainerStatus>> {
        match self.docker.inspect_container(name, None).await {
            Ok(inspect) => {
                let id = inspect.id.unwrap_or_else(|| name.to_string());
                let state = inspect.state.unwrap_or_default();
                let running = state.running.unwrap_or(false);
                let healthy = !matches!(
                    state.status,
                    Some(ContainerStateStatusEnum::DEAD)
                        | Some(ContainerStateStatusEnum::REMOVING)
                );
                Ok(Some(ContainerStatus {
                    id,
                    running,
                    healthy,
                }))
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(EnvError::docker(
                Phase::Resolve,
                format!("failed to inspect container {name}: {e}"),
            )),
        }
    }

    /// Pulls an image if it is not present locally.
    pub async fn pull_if_missing(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => {
                return Err(EnvError::docker(
                    Phase::Resolve,
                    format!("failed to inspect image {image}: {e}"),
                ))
            }
        }

        debug!("Pulling image: {image}");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| {
                EnvError::docker(Phase::Resolve, format!("failed to pull {image}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Creates and starts a container running an idle login shell.
    pub async fn create_container(&self, image: &str, name: &str) -> Result<ContainerHandle> {
        self.pull_if_missing(image).await?;

        let config = ContainerConfig {
            image: Some(image.to_string()),
            cmd: Some(vec![
                "/bin/bash".to_string(),
                "-l".to_string(),
                "-m".to_string(),
            ]),
            tty: Some(true),
            open_stdin: Some(true),
            ..Default::default()
        };

        debug!("Creating container: {name}");
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| {
                EnvError::docker(Phase::Resolve, format!("failed to create container {name}: {e}"))
            })?;

        self.start(name).await?;

        Ok(ContainerHandle {
            id: created.id,
            name: name.to_string(),
        })
    }

    /// Starts a stopped container.
    pub async fn start(&self, name: &str) -> Result<()> {
        self.docker
            .start_container::<String>(name, None)
            .await
            .map_err(|e| {
                EnvError::docker(Phase::Resolve, format!("failed to start container {name}: {e}"))
            })?;
        Ok(())
    }

    /// Stops a container, giving it a few seconds to exit.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.docker
            .stop_container(name, Some(StopContainerOptions { t: 5 }))
            .await
            .map_err(|e| {
                EnvError::docker(Phase::Resolve, format!("failed to stop container {name}: {e}"))
            })?;
        Ok(())
    }

    /// Force-removes a container.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| {
                EnvError::docker(Phase::Resolve, format!("failed to remove container {name}: {e}"))
            })?;
        Ok(())
    }

    /// Commits a container's filesystem to `repo:tag`.
    pub async fn commit_container(&self, container: &str, repo: &str, tag: &str) -> Result<()> {
        self.docker
            .commit_container(
                CommitContainerOptions {
                    container: container.to_string(),
                    repo: repo.to_string(),
                    tag: tag.to_string(),
                    pause: true,
                    ..Default::default()
                },
                ContainerConfig::<String>::default(),
            )
            .await
            .map_err(|e| {
                EnvError::docker(
                    Phase::Install,
                    format!("failed to commit container {container} to {repo}:{tag}: {e}"),
                )
            })?;
        Ok(())
    }

    /// Whether an image with the given reference exists locally.
    pub async fn image_exists(&self, reference: &str) -> Result<bool> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(EnvError::docker(
                Phase::Install,
                format!("failed to inspect image {reference}: {e}"),
            )),
        }
    }

    /// Lists local image tags starting with `prefix`.
    pub async fn list_images_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| EnvError::docker(Phase::Install, format!("failed to list images: {e}")))?;

        let mut tags: Vec<String> = images
            .iter()
            .flat_map(|image| image.repo_tags.iter())
            .filter(|tag| tag.starts_with(prefix))
            .cloned()
            .collect();
        tags.sort();
        Ok(tags)
    }

    /// Removes an image by tag.
    pub async fn remove_image(&self, reference: &str) -> Result<()> {
        self.docker
            .remove_image(
                reference,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await
            .map_err(|e| {
                EnvError::docker(Phase::Install, format!("failed to remove image {reference}: {e}"))
            })?;
        Ok(())
    }

    /// Uploads a tar archive into the container at `dest`.
    pub async fn upload_archive(
        &self,
        container: &str,
        dest: &str,
        archive: Bytes,
        phase: Phase,
    ) -> Result<()> {
        self.docker
            .upload_to_container(
                container,
                Some(UploadToContainerOptions {
                    path: dest.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| {
                EnvError::docker(phase, format!("failed to upload archive to {container}:{dest}: {e}"))
            })?;
        Ok(())
    }

    /// Runs a one-shot exec and collects its output and exit code.
    pub async fn exec_collect(
        &self,
        container: &str,
        argv: Vec<String>,
        env: Vec<String>,
        working_dir: Option<String>,
        timeout: Duration,
        phase: Phase,
    ) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(argv),
                    env: if env.is_empty() { None } else { Some(env) },
                    working_dir,
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EnvError::docker(phase, format!("failed to create exec: {e}")))?;

        let mut output = String::new();

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EnvError::docker(phase, format!("failed to start exec: {e}")))?
        {
            let collect = async {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message })
                        | Ok(LogOutput::StdErr { message })
                        | Ok(LogOutput::Console { message }) => {
                            output.push_str(&String::from_utf8_lossy(&message));
                        }
                        Err(e) => {
                            warn!("Error reading exec output: {e}");
                        }
                        _ => {}
                    }
                }
            };

            if tokio::time::timeout(timeout, collect).await.is_err() {
                return Err(EnvError::timeout(timeout));
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| EnvError::docker(phase, format!("failed to inspect exec: {e}")))?;

        Ok(ExecOutput {
            output,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    /// Starts a long-lived exec with attached stdin, for the shell channel.
    pub async fn start_shell_exec(&self, container: &str, argv: Vec<String>) -> Result<ShellExec> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(argv),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                EnvError::docker(Phase::Resolve, format!("failed to create shell exec: {e}"))
            })?;

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| {
                EnvError::docker(Phase::Resolve, format!("failed to start shell exec: {e}"))
            })? {
            StartExecResults::Attached { output, input } => Ok(ShellExec {
                id: exec.id,
                input,
                output,
            }),
            StartExecResults::Detached => Err(EnvError::docker(
                Phase::Resolve,
                "shell exec started detached, expected attached streams",
            )),
        }
    }

    /// Lists every PID currently alive in the container.
    pub async fn list_pids(&self, container: &str) -> Result<Vec<u32>> {
        let result = self
            .exec_collect(
                container,
                vec!["ps".to_string(), "-eo".to_string(), "pid=".to_string()],
                Vec::new(),
                None,
                Duration::from_secs(10),
                Phase::Execute,
            )
            .await?;

        Ok(result
            .output
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect())
    }

    /// Kills every PID in the container except the given ones.
    ///
    /// Returns the number of PIDs signalled. Used to cut short a runaway
    /// command without disturbing the shell that hosts it.
    pub async fn kill_except(&self, container: &str, keep: &[u32]) -> Result<usize> {
        let pids = self.list_pids(container).await?;
        let targets: Vec<u32> = pids.into_iter().filter(|pid| !keep.contains(pid)).collect();

        if targets.is_empty() {
            return Ok(0);
        }

        let list = targets
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        debug!("Killing container PIDs: {list}");

        self.exec_collect(
            container,
            vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                format!("kill -9 {list} 2>/dev/null || true"),
            ],
            Vec::new(),
            None,
            Duration::from_secs(10),
            Phase::Execute,
        )
        .await?;

        Ok(targets.len())
    }
}

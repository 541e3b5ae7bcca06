//! Sandbox lifecycle manager.
//!
//! [`TaskEnv`] owns one Docker-backed task environment end to end:
//! container resolution, command channel, repository materialization,
//! environment installation, and teardown. `reset` drives the sandbox
//! to a ready state, `execute` runs agent commands through the channel,
//! `interrupt` cuts a runaway command short out-of-band, and `close`
//! releases or parks the container.

use std::path::Path;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{CommandChannel, ExecOutput, ProcessChannel, ShellChannel};
use crate::config::{CommunicateMethod, EnvConfig};
use crate::error::{EnvError, Phase, Result};
use crate::hooks::{EnvHook, HookRegistry};
use crate::install::{self, Fingerprint, InstallOutcome, Installer, SetupSpec};
use crate::pr;
use crate::repo::{self, RepoSource};
use crate::runtime::{ContainerHandle, DockerRuntime};
use crate::trajectory::Trajectory;

/// Deadline for quick internal probes (repo presence, rev-parse, cd).
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for repository materialization steps; clones of large
/// repositories dominate this.
const MATERIALIZE_TIMEOUT: Duration = Duration::from_secs(600);

/// Lifecycle states of a task environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    /// Constructed, no sandbox yet.
    Uninitialized,
    /// `reset` is resolving a container.
    Resolving,
    /// `reset` is installing the task environment.
    Installing,
    /// Sandbox is up and idle.
    Ready,
    /// A command is in flight.
    Running,
    /// `close` has run.
    Closed,
    /// A reset or execute left the sandbox unusable.
    Error,
}

impl std::fmt::Display for EnvState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnvState::Uninitialized => "uninitialized",
            EnvState::Resolving => "resolving",
            EnvState::Installing => "installing",
            EnvState::Ready => "ready",
            EnvState::Running => "running",
            EnvState::Closed => "closed",
            EnvState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// How the sandbox container was obtained during `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A new container was created.
    Created,
    /// An existing persistent container was attached, restarting it if
    /// it had stopped.
    Attached,
    /// An unhealthy persistent container was removed and recreated.
    Recreated,
}

/// An open sandbox: the container, how it was obtained, and the channel
/// into it.
pub(crate) struct Session {
    pub(crate) container: ContainerHandle,
    pub(crate) resolution: Resolution,
    pub(crate) channel: Box<dyn CommandChannel>,
    pub(crate) repo_name: String,
    pub(crate) checkout_rev: Option<String>,
}

/// Container name + parent PIDs, kept outside the session lock so
/// `interrupt` never waits on an in-flight `execute`.
#[derive(Clone)]
struct InterruptTarget {
    container: String,
    parent_pids: Vec<u32>,
}

/// One reproducible task environment.
pub struct TaskEnv {
    config: EnvConfig,
    setup: Option<SetupSpec>,
    runtime: DockerRuntime,
    hooks: StdMutex<HookRegistry>,
    state: StdMutex<EnvState>,
    session: AsyncMutex<Option<Session>>,
    interrupt_target: StdMutex<Option<InterruptTarget>>,
    cached_prefix: StdMutex<Option<String>>,
    last_install: StdMutex<Option<InstallOutcome>>,
}

impl std::fmt::Debug for TaskEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEnv")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TaskEnv {
    /// Validates the config and builds the environment. No daemon I/O
    /// happens until [`reset`](Self::reset).
    pub fn new(config: EnvConfig) -> Result<Self> {
        config.validate()?;

        let setup = match &config.environment_setup {
            Some(path) => Some(SetupSpec::from_path(path)?),
            None => None,
        };

        let runtime = DockerRuntime::connect()?;

        Ok(Self {
            config,
            setup,
            runtime,
            hooks: StdMutex::new(HookRegistry::new()),
            state: StdMutex::new(EnvState::Uninitialized),
            session: AsyncMutex::new(None),
            interrupt_target: StdMutex::new(None),
            cached_prefix: StdMutex::new(None),
            last_install: StdMutex::new(None),
        })
    }

    /// Registers a hook and fires its `on_init`.
    pub fn add_hook(&mut self, hook: Box<dyn EnvHook>) -> Result<()> {
        lock(&self.hooks).add(hook)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EnvState {
        *lock(&self.state)
    }

    /// Prefix under which this environment's cached task images are
    /// tagged. `None` until a cached build or restore completes.
    pub fn cached_image_prefix(&self) -> Option<String> {
        lock(&self.cached_prefix).clone()
    }

    /// How the most recent `reset` installed the environment.
    pub fn last_install_outcome(&self) -> Option<InstallOutcome> {
        lock(&self.last_install).clone()
    }

    /// How the current sandbox container was obtained, when one is open.
    pub async fn resolution(&self) -> Option<Resolution> {
        self.session.lock().await.as_ref().map(|s| s.resolution)
    }

    /// Drives the sandbox to a ready state. Idempotent: an existing
    /// session is torn down first, a persistent container is reattached.
    pub async fn reset(&self) -> Result<()> {
        lock(&self.hooks).reset_start()?;
        self.set_state(EnvState::Resolving);
        info!("Resetting task environment");

        match self.reset_inner().await {
            Ok(()) => {
                self.set_state(EnvState::Ready);
                info!("Task environment ready");
                lock(&self.hooks).reset_complete()?;
                Ok(())
            }
            Err(e) => {
                self.set_state(EnvState::Error);
                Err(e)
            }
        }
    }

    async fn reset_inner(&self) -> Result<()> {
        self.teardown_session().await;
        self.runtime.ping().await?;

        let (_task, repo_source) = repo::resolve_sources(&self.config)?;
        let repo_name = repo::repo_dir_name(&repo_source)?;
        let fingerprint = Fingerprint::compute(&self.config.image_name, self.setup.as_ref());

        // Cached task images short-circuit the install entirely.
        let mut from_cache = None;
        let mut base_image = self.config.image_name.clone();
        if self.config.cache_task_images {
            let cached = install::cached_image_tag(&self.config.image_name, &fingerprint);
            if self.runtime.image_exists(&cached).await? {
                info!("Restoring environment from cached image {cached}");
                base_image = cached.clone();
                from_cache = Some(cached);
            }
        }

        let (container, resolution) = self.resolve_container(&base_image).await?;

        let provisioned = self
            .provision(
                &container,
                resolution,
                from_cache,
                &fingerprint,
                &repo_source,
                &repo_name,
            )
            .await;
        let (channel, checkout_rev, outcome) = match provisioned {
            Ok(parts) => parts,
            Err(e) => {
                *lock(&self.interrupt_target) = None;
                if self.config.container_name.is_none() {
                    if let Err(remove_err) = self.runtime.remove(&container.name).await {
                        warn!(
                            "Failed to remove container {} after failed reset: {remove_err}",
                            container.name
                        );
                    }
                }
                return Err(e);
            }
        };

        if self.config.cache_task_images {
            *lock(&self.cached_prefix) =
                Some(install::cached_image_prefix(&self.config.image_name));
        }
        *lock(&self.last_install) = Some(outcome);

        *self.session.lock().await = Some(Session {
            container,
            resolution,
            channel,
            repo_name,
            checkout_rev,
        });
        Ok(())
    }

    /// Everything between container start and session storage. On error
    /// the caller disposes of the container.
    async fn provision(
        &self,
        container: &ContainerHandle,
        resolution: Resolution,
        from_cache: Option<String>,
        fingerprint: &Fingerprint,
        source: &RepoSource,
        name: &str,
    ) -> Result<(Box<dyn CommandChannel>, Option<String>, InstallOutcome)> {
        let repo_dir = repo::repo_dir(name);

        let mut channel = self.open_channel(container, &repo_dir).await?;
        *lock(&self.interrupt_target) = Some(InterruptTarget {
            container: container.id.clone(),
            parent_pids: channel.parent_pids().to_vec(),
        });

        self.materialize_repo(container, source, name).await?;
        let checkout_rev = self.checkout_rev(container, name).await;
        if self.config.communicate_method == CommunicateMethod::Shell {
            let cd = channel
                .execute(&format!("cd {}", shell_words::quote(&repo_dir)), PROBE_TIMEOUT)
                .await?;
            if !cd.success() {
                warn!("Could not enter {repo_dir}: {}", cd.output.trim());
            }
        }

        let outcome = match from_cache {
            Some(image) => InstallOutcome::Restored { image },
            None => {
                self.set_state(EnvState::Installing);
                let outcome = self
                    .install(channel.as_mut(), container, resolution, fingerprint, &repo_dir)
                    .await?;

                if self.config.cache_task_images {
                    let tag = install::cached_image_tag(&self.config.image_name, fingerprint);
                    info!("Caching installed environment as {tag}");
                    self.runtime
                        .commit_container(&container.id, &tag, "latest")
                        .await?;
                }
                outcome
            }
        };

        Ok((channel, checkout_rev, outcome))
    }

    /// Finds or creates the sandbox container.
    async fn resolve_container(&self, image: &str) -> Result<(ContainerHandle, Resolution)> {
        match &self.config.container_name {
            Some(name) => match self.runtime.inspect(name).await? {
                Some(status) if status.healthy => {
                    if !status.running {
                        self.runtime.start(name).await?;
                    }
                    debug!("Attached to container {name}");
                    Ok((
                        ContainerHandle {
                            id: status.id,
                            name: name.clone(),
                        },
                        Resolution::Attached,
                    ))
                }
                Some(_) => {
                    warn!("Container {name} is unhealthy, recreating it");
                    self.runtime.remove(name).await?;
                    let handle =
                        self.runtime
                            .create_container(image, name)
                            .await
                            .map_err(|e| {
                                EnvError::sandbox_unavailable(
                                    Phase::Resolve,
                                    format!("container {name} could not be recreated: {e}"),
                                )
                            })?;
                    Ok((handle, Resolution::Recreated))
                }
                None => {
                    let handle = self.runtime.create_container(image, name).await?;
                    Ok((handle, Resolution::Created))
                }
            },
            None => {
                let name = ephemeral_name();
                let handle = self.runtime.create_container(image, &name).await?;
                Ok((handle, Resolution::Created))
            }
        }
    }

    async fn open_channel(
        &self,
        container: &ContainerHandle,
        repo_dir: &str,
    ) -> Result<Box<dyn CommandChannel>> {
        match self.config.communicate_method {
            CommunicateMethod::Shell => Ok(Box::new(
                ShellChannel::open(self.runtime.clone(), &container.id).await?,
            )),
            CommunicateMethod::Process => Ok(Box::new(ProcessChannel::new(
                self.runtime.clone(),
                &container.id,
                repo_dir,
            ))),
        }
    }

    /// Puts the repository in place and forces it to a consistent tree
    /// at the base revision. Runs as out-of-band execs so it works
    /// before the repository directory exists.
    async fn materialize_repo(
        &self,
        container: &ContainerHandle,
        source: &RepoSource,
        name: &str,
    ) -> Result<()> {
        let probe = repo::repo_present_probe(name);
        let present = self
            .run_resolve_step(&container.id, &probe, PROBE_TIMEOUT)
            .await?
            .success();

        if present {
            debug!("Repository /{name} already present in the sandbox");
        } else {
            match source {
                RepoSource::Local(path) => {
                    info!("Copying repository {} into the sandbox", path.display());
                    let archive = archive_repo(path, name)?;
                    self.runtime
                        .upload_archive(&container.id, "/", archive, Phase::Resolve)
                        .await?;
                }
                RepoSource::Remote { owner, repo } => {
                    info!("Cloning {owner}/{repo} into the sandbox");
                    let commands = repo::clone_commands(
                        owner,
                        repo,
                        name,
                        self.config.clone_method,
                        self.config.base_commit.as_deref(),
                    );
                    for command in commands {
                        self.require_resolve_step(&container.id, &command, MATERIALIZE_TIMEOUT)
                            .await?;
                    }
                }
            }
        }

        for command in repo::state_reset_commands(name, self.config.base_commit.as_deref()) {
            self.require_resolve_step(&container.id, &command, PROBE_TIMEOUT)
                .await?;
        }
        Ok(())
    }

    async fn run_resolve_step(
        &self,
        container: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        self.runtime
            .exec_collect(
                container,
                bash_c(command),
                Vec::new(),
                None,
                timeout,
                Phase::Resolve,
            )
            .await
    }

    /// Like [`run_resolve_step`](Self::run_resolve_step), but a non-zero
    /// exit is an error.
    async fn require_resolve_step(
        &self,
        container: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<()> {
        let result = self.run_resolve_step(container, command, timeout).await?;
        if !result.success() {
            return Err(EnvError::sandbox_unavailable(
                Phase::Resolve,
                format!(
                    "`{command}` exited with {}: {}",
                    result.exit_code,
                    result.output.trim()
                ),
            ));
        }
        Ok(())
    }

    /// Revision the repository sits at after materialization, used as
    /// the diff base when publishing.
    async fn checkout_rev(&self, container: &ContainerHandle, name: &str) -> Option<String> {
        let command = format!(
            "git -C {} rev-parse HEAD",
            shell_words::quote(&repo::repo_dir(name))
        );
        match self.run_resolve_step(&container.id, &command, PROBE_TIMEOUT).await {
            Ok(result) if result.success() => Some(result.output.trim().to_string()),
            Ok(result) => {
                warn!("Could not determine checkout revision: {}", result.output.trim());
                None
            }
            Err(e) => {
                warn!("Could not determine checkout revision: {e}");
                None
            }
        }
    }

    async fn install(
        &self,
        channel: &mut dyn CommandChannel,
        container: &ContainerHandle,
        resolution: Resolution,
        fingerprint: &Fingerprint,
        repo_dir: &str,
    ) -> Result<InstallOutcome> {
        let mut installer = Installer::new(channel, &self.runtime, &container.id, repo_dir);

        // A reattached sandbox that was installed for the same image and
        // setup spec is reused as-is; anything else is (re)installed.
        if resolution == Resolution::Attached {
            match installer.read_marker().await? {
                Some(marker) if marker == fingerprint.as_str() => {
                    debug!("Environment fingerprint {fingerprint} up to date, skipping install");
                    return Ok(InstallOutcome::UpToDate);
                }
                Some(marker) => {
                    warn!(
                        "Environment fingerprint mismatch (found {marker}, expected {fingerprint}), reinstalling"
                    );
                }
                None => {}
            }
        }

        let outcome = installer.run(self.setup.as_ref()).await?;
        installer.write_marker(fingerprint).await?;
        Ok(outcome)
    }

    /// Runs one command inside the sandbox.
    ///
    /// A blank command short-circuits to an empty success without
    /// touching the sandbox. A timeout is returned as a matchable
    /// [`EnvError::Timeout`] with the environment back in `Ready`; only
    /// a failed timeout recovery poisons the environment.
    pub async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        if command.trim().is_empty() {
            return Ok(ExecOutput::default());
        }

        {
            let mut state = lock(&self.state);
            if *state != EnvState::Ready {
                return Err(EnvError::sandbox_unavailable(
                    Phase::Execute,
                    format!("environment is {state}, call reset first"),
                ));
            }
            *state = EnvState::Running;
        }

        let mut session = self.session.lock().await;
        let result = match session.as_mut() {
            Some(session) => session.channel.execute(command, timeout).await,
            None => Err(EnvError::sandbox_unavailable(
                Phase::Execute,
                "no open sandbox, call reset first",
            )),
        };
        drop(session);

        match &result {
            Ok(_) => self.set_state(EnvState::Ready),
            Err(e) if e.is_timeout() => {
                warn!("Command timed out, environment recovered");
                self.set_state(EnvState::Ready);
            }
            Err(_) => self.set_state(EnvState::Error),
        }
        result
    }

    /// Kills every process in the sandbox outside the channel's parent
    /// set. Intended to be called from another task while `execute`
    /// blocks; the interrupted command then completes through the
    /// channel with the killed command's exit code.
    pub async fn interrupt(&self) -> Result<()> {
        if self.state() != EnvState::Running {
            debug!("No command in flight, nothing to interrupt");
            return Ok(());
        }

        let Some(target) = lock(&self.interrupt_target).clone() else {
            return Ok(());
        };

        let killed = self
            .runtime
            .kill_except(&target.container, &target.parent_pids)
            .await?;
        info!("Interrupted {killed} process(es)");
        Ok(())
    }

    /// Releases the sandbox. A persistent container is stopped and left
    /// behind for the next attach; an ephemeral one is removed.
    /// Idempotent, and safe after a failed `reset`.
    pub async fn close(&self) -> Result<()> {
        if self.state() == EnvState::Closed {
            return Ok(());
        }

        self.teardown_session().await;
        lock(&self.hooks).close();
        self.set_state(EnvState::Closed);
        Ok(())
    }

    /// Publishes the sandbox's current diff as a pull request. See
    /// [`pr`] for the steps; `dry_run` stops short of the push and API
    /// calls and returns `None`.
    ///
    /// Without an open session this attaches to the persistent
    /// container as-is (no repository reset, which would wipe the very
    /// changes being published).
    pub async fn open_pr(
        &self,
        dry_run: bool,
        trajectory: &Trajectory,
    ) -> Result<Option<String>> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.attach_for_publish().await?);
        }
        let session = session.as_mut().ok_or_else(|| {
            EnvError::sandbox_unavailable(Phase::Publish, "no open sandbox, call reset first")
        })?;
        pr::publish(&self.config, &self.runtime, session, dry_run, trajectory).await
    }

    /// Opens a read-mostly session against an existing persistent
    /// container, leaving its working tree untouched. The diff base
    /// falls back to `base_commit` or HEAD because the original
    /// checkout revision is not known here.
    async fn attach_for_publish(&self) -> Result<Session> {
        let name = self.config.container_name.as_deref().ok_or_else(|| {
            EnvError::sandbox_unavailable(
                Phase::Publish,
                "no open sandbox: publishing without a prior reset requires container_name",
            )
        })?;

        self.runtime.ping().await?;
        let status = self.runtime.inspect(name).await?.ok_or_else(|| {
            EnvError::sandbox_unavailable(
                Phase::Publish,
                format!("container {name} does not exist"),
            )
        })?;
        if !status.running {
            self.runtime.start(name).await?;
        }
        let container = ContainerHandle {
            id: status.id,
            name: name.to_string(),
        };

        let (_task, source) = repo::resolve_sources(&self.config)?;
        let repo_name = repo::repo_dir_name(&source)?;
        let channel = self
            .open_channel(&container, &repo::repo_dir(&repo_name))
            .await?;
        *lock(&self.interrupt_target) = Some(InterruptTarget {
            container: container.id.clone(),
            parent_pids: channel.parent_pids().to_vec(),
        });

        Ok(Session {
            container,
            resolution: Resolution::Attached,
            channel,
            repo_name,
            checkout_rev: None,
        })
    }

    /// Best-effort teardown of the current session, if any.
    async fn teardown_session(&self) {
        let session = self.session.lock().await.take();
        *lock(&self.interrupt_target) = None;

        if let Some(mut session) = session {
            session.channel.close().await;
            let name = &session.container.name;
            if self.config.container_name.is_some() {
                debug!("Stopping persistent container {name}");
                if let Err(e) = self.runtime.stop(name).await {
                    warn!("Failed to stop container {name}: {e}");
                }
            } else {
                debug!("Removing container {name}");
                if let Err(e) = self.runtime.remove(name).await {
                    warn!("Failed to remove container {name}: {e}");
                }
            }
        }
    }

    fn set_state(&self, next: EnvState) {
        *lock(&self.state) = next;
        debug!("Environment state: {next}");
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn bash_c(command: &str) -> Vec<String> {
    vec![
        "/bin/bash".to_string(),
        "-c".to_string(),
        command.to_string(),
    ]
}

fn ephemeral_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("patchbox-{}", &id[..8])
}

/// Tars a local repository so it lands at `/<name>` in the container.
fn archive_repo(path: &Path, name: &str) -> Result<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(name, path).map_err(|e| {
        EnvError::sandbox_unavailable(
            Phase::Resolve,
            format!("failed to archive repository {}: {e}", path.display()),
        )
    })?;
    let archive = builder.into_inner().map_err(|e| {
        EnvError::sandbox_unavailable(
            Phase::Resolve,
            format!("failed to finish repository archive: {e}"),
        )
    })?;
    Ok(Bytes::from(archive))
}

//! Environment installation and caching.
//!
//! A setup specification is either a shell script (run verbatim) or a
//! YAML manifest describing an interpreter, packages, and an install
//! command. Installations are fingerprinted so the lifecycle manager can
//! cache built environments as images and recognize a sandbox whose
//! installed state already matches.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::channel::{CommandChannel, ENV_FILE};
use crate::error::{EnvError, Phase, Result};
use crate::runtime::DockerRuntime;

/// Marker file inside the sandbox recording which fingerprint built it.
pub const FINGERPRINT_FILE: &str = "/root/.patchbox-env-fingerprint";

/// Where setup scripts are uploaded before execution.
const SCRIPT_PATH: &str = "/root/setup.sh";

/// Virtualenv created for the task by the manifest path.
const VENV_PATH: &str = "/root/venvs/task";

/// Deadline for a single installation step. Builds are slow; agent
/// commands are not, so this is deliberately much longer than the
/// execution default.
const INSTALL_STEP_TIMEOUT: Duration = Duration::from_secs(600);

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Structured environment manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupManifest {
    /// Interpreter version to provision, e.g. `"3.10"`. Probed as
    /// `python<version>`; when the image already ships it, the task
    /// environment is cloned from it instead of built from scratch.
    #[serde(default)]
    pub interpreter: Option<String>,

    /// Packages installed with apt.
    #[serde(default)]
    pub system_packages: Vec<String>,

    /// Packages installed with pip into the task environment.
    #[serde(default)]
    pub packages: Vec<String>,

    /// Command run in the repository directory after packages, typically
    /// an editable install.
    #[serde(default)]
    pub install: Option<String>,
}

/// Parsed environment setup specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupSpec {
    /// A shell script, snapshotted at parse time.
    Script {
        /// Original path, for log lines.
        path: PathBuf,
        /// Script bytes as read from disk.
        contents: Vec<u8>,
    },
    /// A structured manifest.
    Manifest(SetupManifest),
}

impl SetupSpec {
    /// Reads and classifies a setup file by extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "sh" => {
                let contents = fs::read(path).map_err(|e| {
                    EnvError::invalid_config(format!(
                        "failed to read setup script {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(Self::Script {
                    path: path.to_path_buf(),
                    contents,
                })
            }
            "yaml" | "yml" => {
                let text = fs::read_to_string(path).map_err(|e| {
                    EnvError::invalid_config(format!(
                        "failed to read setup manifest {}: {e}",
                        path.display()
                    ))
                })?;
                let manifest: SetupManifest = serde_yaml::from_str(&text).map_err(|e| {
                    EnvError::invalid_config(format!(
                        "failed to parse setup manifest {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(Self::Manifest(manifest))
            }
            other => Err(EnvError::invalid_config(format!(
                "unsupported environment setup extension '{other}' for {}: expected .sh, .yaml, or .yml",
                path.display()
            ))),
        }
    }
}

/// Deterministic digest of base image + setup spec, used as the cache
/// key for task images and as the in-sandbox staleness marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint for an image/spec pair.
    pub fn compute(image: &str, spec: Option<&SetupSpec>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(image.as_bytes());
        hasher.update([0u8]);

        match spec {
            None => hasher.update(b"none".as_slice()),
            Some(SetupSpec::Script { contents, .. }) => {
                hasher.update(b"script".as_slice());
                hasher.update([0u8]);
                hasher.update(contents);
            }
            Some(SetupSpec::Manifest(manifest)) => {
                hasher.update(b"manifest".as_slice());
                hasher.update([0u8]);
                hasher.update(manifest.interpreter.as_deref().unwrap_or("").as_bytes());
                for package in &manifest.system_packages {
                    hasher.update([1u8]);
                    hasher.update(package.as_bytes());
                }
                for package in &manifest.packages {
                    hasher.update([2u8]);
                    hasher.update(package.as_bytes());
                }
                hasher.update([3u8]);
                hasher.update(manifest.install.as_deref().unwrap_or("").as_bytes());
            }
        }

        let digest = hex::encode(hasher.finalize());
        Self(digest[..12].to_string())
    }

    /// The fingerprint as a 12-char hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Prefix under which cached task images for a base image are tagged.
pub fn cached_image_prefix(image: &str) -> String {
    format!("patchbox-task-env-{}", sanitize_image_name(image))
}

/// Full cached image name for an image + fingerprint pair.
pub fn cached_image_tag(image: &str, fingerprint: &Fingerprint) -> String {
    format!("{}-{fingerprint}", cached_image_prefix(image))
}

fn sanitize_image_name(image: &str) -> String {
    image
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// How an installation concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// No environment specification was configured.
    Skipped,
    /// The sandbox's marker matched the current fingerprint.
    UpToDate,
    /// A setup script ran to completion.
    Script,
    /// The task environment was cloned from an interpreter already in
    /// the image.
    Cloned {
        /// Interpreter version that was cloned.
        interpreter: String,
    },
    /// The environment was built from scratch.
    Built {
        /// Interpreter version installed, when one was requested.
        interpreter: Option<String>,
    },
    /// The sandbox was started from a cached task image.
    Restored {
        /// The cached image it came from.
        image: String,
    },
}

/// Drives an installation through the command channel.
pub struct Installer<'a> {
    channel: &'a mut dyn CommandChannel,
    runtime: &'a DockerRuntime,
    container_id: &'a str,
    repo_dir: &'a str,
}

impl<'a> Installer<'a> {
    /// Binds an installer to an open channel and its container.
    pub fn new(
        channel: &'a mut dyn CommandChannel,
        runtime: &'a DockerRuntime,
        container_id: &'a str,
        repo_dir: &'a str,
    ) -> Self {
        Self {
            channel,
            runtime,
            container_id,
            repo_dir,
        }
    }

    /// Runs the installation described by `spec`.
    pub async fn run(&mut self, spec: Option<&SetupSpec>) -> Result<InstallOutcome> {
        match spec {
            None => {
                debug!("No environment setup configured, skipping install");
                Ok(InstallOutcome::Skipped)
            }
            Some(SetupSpec::Script { path, contents }) => {
                info!("Running setup script {}", path.display());
                self.upload_script(contents).await?;
                self.run_step("setup script", &format!("bash {SCRIPT_PATH}"))
                    .await?;
                Ok(InstallOutcome::Script)
            }
            Some(SetupSpec::Manifest(manifest)) => self.install_manifest(manifest).await,
        }
    }

    /// Reads the fingerprint marker from a (possibly reused) sandbox.
    pub async fn read_marker(&mut self) -> Result<Option<String>> {
        let result = self
            .channel
            .execute(
                &format!("cat {FINGERPRINT_FILE} 2>/dev/null || true"),
                PROBE_TIMEOUT,
            )
            .await?;
        let marker = result.output.trim().to_string();
        Ok(if marker.is_empty() { None } else { Some(marker) })
    }

    /// Records the fingerprint that built this sandbox.
    pub async fn write_marker(&mut self, fingerprint: &Fingerprint) -> Result<()> {
        self.run_step(
            "record fingerprint",
            &format!("printf '%s' '{fingerprint}' > {FINGERPRINT_FILE}"),
        )
        .await?;
        Ok(())
    }

    async fn upload_script(&mut self, contents: &[u8]) -> Result<()> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "setup.sh", contents)
            .map_err(|e| EnvError::install_failed(format!("failed to build setup archive: {e}")))?;
        let archive = builder
            .into_inner()
            .map_err(|e| EnvError::install_failed(format!("failed to finish setup archive: {e}")))?;

        self.runtime
            .upload_archive(
                self.container_id,
                "/root",
                Bytes::from(archive),
                Phase::Install,
            )
            .await
    }

    async fn install_manifest(&mut self, manifest: &SetupManifest) -> Result<InstallOutcome> {
        let outcome = match &manifest.interpreter {
            Some(version) => {
                let probe = self
                    .channel
                    .execute(&format!("command -v python{version}"), PROBE_TIMEOUT)
                    .await?;

                if probe.success() {
                    self.run_step(
                        "clone interpreter environment",
                        &format!("python{version} -m venv --clear {VENV_PATH}"),
                    )
                    .await?;
                    info!("Cloned existing interpreter environment {version}");
                    InstallOutcome::Cloned {
                        interpreter: version.clone(),
                    }
                } else {
                    self.run_step("apt update", "apt-get update -y").await?;
                    self.run_step(
                        "install interpreter",
                        &format!(
                            "DEBIAN_FRONTEND=noninteractive apt-get install -y \
                             python{version} python{version}-venv"
                        ),
                    )
                    .await?;
                    self.run_step(
                        "create interpreter environment",
                        &format!("python{version} -m venv --clear {VENV_PATH}"),
                    )
                    .await?;
                    info!("Built interpreter environment {version} from scratch");
                    InstallOutcome::Built {
                        interpreter: Some(version.clone()),
                    }
                }
            }
            None => InstallOutcome::Built { interpreter: None },
        };

        if !manifest.system_packages.is_empty() {
            let list = quote_all(&manifest.system_packages);
            self.run_step("apt update", "apt-get update -y").await?;
            self.run_step(
                "system packages",
                &format!("DEBIAN_FRONTEND=noninteractive apt-get install -y {list}"),
            )
            .await?;
        }

        if !manifest.packages.is_empty() {
            let list = quote_all(&manifest.packages);
            let pip = if manifest.interpreter.is_some() {
                format!("{VENV_PATH}/bin/pip")
            } else {
                "python3 -m pip".to_string()
            };
            self.run_step("python packages", &format!("{pip} install {list}"))
                .await?;
        }

        if manifest.interpreter.is_some() {
            let activate = format!("source {VENV_PATH}/bin/activate");
            self.run_step(
                "register activation",
                &format!("grep -qxF '{activate}' {ENV_FILE} 2>/dev/null || echo '{activate}' >> {ENV_FILE}"),
            )
            .await?;
            // Apply to the current session as well; the env file only
            // reaches shells opened after this point.
            self.run_step("activate environment", &activate).await?;
        }

        if let Some(install) = &manifest.install {
            // Subshell so the session's working directory is untouched.
            self.run_step("install command", &format!("(cd {} && {install})", self.repo_dir))
                .await?;
        }

        Ok(outcome)
    }

    async fn run_step(&mut self, step: &str, command: &str) -> Result<String> {
        debug!("Install step: {step}");
        let result = self.channel.execute(command, INSTALL_STEP_TIMEOUT).await?;
        if !result.success() {
            return Err(EnvError::install_failed(format!(
                "step '{step}' exited with {}: {}",
                result.exit_code,
                output_tail(&result.output)
            )));
        }
        Ok(result.output)
    }
}

fn quote_all(items: &[String]) -> String {
    items
        .iter()
        .map(|item| shell_words::quote(item).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn output_tail(output: &str) -> String {
    const MAX: usize = 2000;
    let count = output.chars().count();
    if count <= MAX {
        output.trim_end().to_string()
    } else {
        let tail: String = output.chars().skip(count - MAX).collect();
        tail.trim_end().to_string()
    }
}

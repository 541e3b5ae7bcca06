//! Task environment configuration.
//!
//! An [`EnvConfig`] describes one task environment: where the task and
//! repository come from, which image to run, and which strategies to use
//! for command execution and cloning. Configuration is validated once,
//! up front, so later lifecycle phases can assume a coherent setup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EnvError, Result};
use crate::repo;

/// Environment variable that overrides the command channel strategy.
pub const COMMUNICATE_METHOD_ENV: &str = "PATCHBOX_COMMUNICATE_METHOD";

/// Environment variable that overrides the repository clone strategy.
pub const CLONE_METHOD_ENV: &str = "PATCHBOX_CLONE_METHOD";

/// How commands are delivered to the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunicateMethod {
    /// One long-lived shell inside the container; commands share state.
    #[default]
    Shell,
    /// A fresh exec per command; no shell state carries over.
    Process,
}

impl std::fmt::Display for CommunicateMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shell => write!(f, "shell"),
            Self::Process => write!(f, "process"),
        }
    }
}

impl std::str::FromStr for CommunicateMethod {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "shell" => Ok(Self::Shell),
            "process" => Ok(Self::Process),
            _ => Err(EnvError::invalid_config(format!(
                "unknown communicate method '{s}' (supported: shell, process)"
            ))),
        }
    }
}

/// How the task repository is cloned into the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneMethod {
    /// Depth-1 clone, plus a targeted fetch when a base commit is pinned.
    #[default]
    Shallow,
    /// Full-history clone.
    Full,
}

impl std::fmt::Display for CloneMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shallow => write!(f, "shallow"),
            Self::Full => write!(f, "full"),
        }
    }
}

impl std::str::FromStr for CloneMethod {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "shallow" => Ok(Self::Shallow),
            "full" => Ok(Self::Full),
            _ => Err(EnvError::invalid_config(format!(
                "unknown clone method '{s}' (supported: shallow, full)"
            ))),
        }
    }
}

/// Configuration for a single task environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Where the task comes from: a GitHub issue URL or a local file.
    pub data_path: String,

    /// Local repository to copy into the sandbox. May be empty when
    /// `data_path` is an issue URL, in which case the issue's repository
    /// is cloned instead.
    #[serde(default)]
    pub repo_path: String,

    /// Docker image the sandbox starts from.
    #[serde(default = "default_image_name")]
    pub image_name: String,

    /// Name of a persistent container to attach to. When unset an
    /// ephemeral container is created and removed on close.
    #[serde(default)]
    pub container_name: Option<String>,

    /// Commit the installed environment to a reusable image after setup.
    #[serde(default)]
    pub cache_task_images: bool,

    /// Environment setup specification: a `.sh` script or a `.yaml`/`.yml`
    /// manifest. When unset, installation is skipped.
    #[serde(default)]
    pub environment_setup: Option<PathBuf>,

    /// Log channel traffic at debug level.
    #[serde(default)]
    pub verbose: bool,

    /// Commit to check the repository out at. Defaults to the default
    /// branch head.
    #[serde(default)]
    pub base_commit: Option<String>,

    /// Command delivery strategy.
    #[serde(default)]
    pub communicate_method: CommunicateMethod,

    /// Repository clone strategy.
    #[serde(default)]
    pub clone_method: CloneMethod,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            data_path: String::new(),
            repo_path: String::new(),
            image_name: default_image_name(),
            container_name: None,
            cache_task_images: false,
            environment_setup: None,
            verbose: false,
            base_commit: None,
            communicate_method: CommunicateMethod::default(),
            clone_method: CloneMethod::default(),
        }
    }
}

fn default_image_name() -> String {
    "patchbox/base:latest".to_string()
}

impl EnvConfig {
    /// Creates a configuration with defaults for everything but the task
    /// and repository sources.
    pub fn new(data_path: impl Into<String>, repo_path: impl Into<String>) -> Self {
        Self {
            data_path: data_path.into(),
            repo_path: repo_path.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from a TOML file and applies environment
    /// variable overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            EnvError::invalid_config(format!("failed to read {}: {e}", path.display()))
        })?;

        let mut config: Self = toml::from_str(&content).map_err(|e| {
            EnvError::invalid_config(format!("failed to parse {}: {e}", path.display()))
        })?;

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies the out-of-band strategy overrides from the process
    /// environment. Strategies are resolved once, here; later changes to
    /// the variables have no effect on an existing environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.communicate_method = resolve_communicate_method(
            self.communicate_method,
            std::env::var(COMMUNICATE_METHOD_ENV).ok().as_deref(),
        )?;
        self.clone_method = resolve_clone_method(
            self.clone_method,
            std::env::var(CLONE_METHOD_ENV).ok().as_deref(),
        )?;
        Ok(())
    }

    /// Checks the configuration for contradictions.
    pub fn validate(&self) -> Result<()> {
        if self.data_path.trim().is_empty() {
            return Err(EnvError::invalid_config("data_path must not be empty"));
        }

        if self.cache_task_images && self.container_name.is_some() {
            return Err(EnvError::invalid_config(
                "setting cache_task_images together with container_name is not allowed: \
                 cached images would leak state between tasks sharing the container",
            ));
        }

        if self.repo_path.trim().is_empty() && repo::parse_issue_url(&self.data_path).is_none() {
            return Err(EnvError::invalid_config(
                "repo_path must be set unless data_path is a GitHub issue URL",
            ));
        }

        Ok(())
    }

    /// Returns `repo_path` with a leading `~` expanded.
    pub fn expanded_repo_path(&self) -> Result<String> {
        expand_path(&self.repo_path)
    }
}

fn resolve_communicate_method(
    configured: CommunicateMethod,
    env_value: Option<&str>,
) -> Result<CommunicateMethod> {
    match env_value {
        Some(value) if !value.trim().is_empty() => value.parse(),
        _ => Ok(configured),
    }
}

fn resolve_clone_method(configured: CloneMethod, env_value: Option<&str>) -> Result<CloneMethod> {
    match env_value {
        Some(value) if !value.trim().is_empty() => value.parse(),
        _ => Ok(configured),
    }
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> Result<String> {
    if path.starts_with("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EnvError::invalid_config("could not determine home directory"))?;
        Ok(path.replacen('~', &home.display().to_string(), 1))
    } else {
        Ok(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> EnvConfig {
        EnvConfig::new("/tasks/issue.md", "/work/repo")
    }

    #[test]
    fn test_default_config() {
        let config = EnvConfig::default();
        assert_eq!(config.image_name, "patchbox/base:latest");
        assert!(config.container_name.is_none());
        assert!(!config.cache_task_images);
        assert_eq!(config.communicate_method, CommunicateMethod::Shell);
        assert_eq!(config.clone_method, CloneMethod::Shallow);
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_empty_data_path_rejected() {
        let config = EnvConfig::new("", "/work/repo");
        let err = config.validate().unwrap_err();
        assert!(err.is_invalid_config());
    }

    #[test]
    fn test_cache_with_persistent_container_rejected() {
        let config = EnvConfig {
            cache_task_images: true,
            container_name: Some("patchbox-dev".to_string()),
            ..valid_config()
        };
        let err = config.validate().unwrap_err();
        assert!(err.is_invalid_config());
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn test_cache_without_container_name_allowed() {
        let config = EnvConfig {
            cache_task_images: true,
            ..valid_config()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_repo_path_requires_issue_url() {
        let config = EnvConfig::new("/tasks/issue.md", "");
        assert!(config.validate().is_err());

        let config = EnvConfig::new("https://github.com/octo/widgets/issues/42", "");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
data_path = "https://github.com/octo/widgets/issues/42"
image_name = "patchbox/py:3.11"
cache_task_images = true
communicate_method = "process"
clone_method = "full"
"#;
        let config: EnvConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.image_name, "patchbox/py:3.11");
        assert!(config.cache_task_images);
        assert_eq!(config.communicate_method, CommunicateMethod::Process);
        assert_eq!(config.clone_method, CloneMethod::Full);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_communicate_method_round_trip() {
        assert_eq!(CommunicateMethod::Shell.to_string(), "shell");
        assert_eq!(CommunicateMethod::Process.to_string(), "process");
        assert_eq!(
            "shell".parse::<CommunicateMethod>().unwrap(),
            CommunicateMethod::Shell
        );
        assert_eq!(
            "Process".parse::<CommunicateMethod>().unwrap(),
            CommunicateMethod::Process
        );
        assert!("pipe".parse::<CommunicateMethod>().is_err());
    }

    #[test]
    fn test_clone_method_round_trip() {
        assert_eq!(CloneMethod::Shallow.to_string(), "shallow");
        assert_eq!(CloneMethod::Full.to_string(), "full");
        assert_eq!("shallow".parse::<CloneMethod>().unwrap(), CloneMethod::Shallow);
        assert_eq!("FULL".parse::<CloneMethod>().unwrap(), CloneMethod::Full);
        assert!("sparse".parse::<CloneMethod>().is_err());
    }

    #[test]
    fn test_env_override_wins_over_configured_value() {
        let resolved =
            resolve_communicate_method(CommunicateMethod::Shell, Some("process")).unwrap();
        assert_eq!(resolved, CommunicateMethod::Process);

        let resolved = resolve_clone_method(CloneMethod::Shallow, Some("full")).unwrap();
        assert_eq!(resolved, CloneMethod::Full);
    }

    #[test]
    fn test_env_override_absent_or_blank_keeps_configured_value() {
        let resolved = resolve_communicate_method(CommunicateMethod::Process, None).unwrap();
        assert_eq!(resolved, CommunicateMethod::Process);

        let resolved = resolve_communicate_method(CommunicateMethod::Process, Some("")).unwrap();
        assert_eq!(resolved, CommunicateMethod::Process);
    }

    #[test]
    fn test_env_override_invalid_value_rejected() {
        assert!(resolve_communicate_method(CommunicateMethod::Shell, Some("osmosis")).is_err());
        assert!(resolve_clone_method(CloneMethod::Shallow, Some("partial")).is_err());
    }

    #[test]
    fn test_expand_path() {
        // Test non-tilde path
        assert_eq!(expand_path("/usr/bin").unwrap(), "/usr/bin");

        // Test tilde expansion (only works if home dir is set)
        if dirs::home_dir().is_some() {
            let expanded = expand_path("~/repo").unwrap();
            assert!(!expanded.starts_with('~'));
            assert!(expanded.ends_with("/repo"));
        }
    }
}

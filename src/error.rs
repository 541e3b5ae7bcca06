//! Domain-specific error types for task environment operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use std::time::Duration;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, EnvError>;

/// Lifecycle phase during which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Resolving or creating the sandbox container.
    Resolve,
    /// Installing the task environment inside the sandbox.
    Install,
    /// Executing a command through the command channel.
    Execute,
    /// Publishing results as a pull request.
    Publish,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Resolve => "resolve",
            Self::Install => "install",
            Self::Execute => "execute",
            Self::Publish => "publish",
        };
        write!(f, "{name}")
    }
}

/// Errors that can occur while managing or using a task environment.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    /// Configuration is contradictory or incomplete.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The sandbox is missing, dead, or refused to come up.
    #[error("Sandbox unavailable during {phase}: {message}")]
    SandboxUnavailable { phase: Phase, message: String },

    /// A command exceeded its allotted execution time.
    #[error("Command timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// Environment installation inside the sandbox failed.
    #[error("Environment install failed: {message}")]
    InstallFailed { message: String },

    /// The working tree could not be inspected for publishing.
    #[error("Repository state could not be determined: {message}")]
    DirtyState { message: String },

    /// There is nothing to publish.
    #[error("No changes to publish: {message}")]
    NoChanges { message: String },

    /// Pushing the branch or opening the pull request failed.
    #[error("Publishing failed: {message}")]
    PublishFailed { message: String },

    /// A Docker API call failed.
    #[error("Docker error during {phase}: {message}")]
    Docker { phase: Phase, message: String },
}

impl EnvError {
    /// Creates an `InvalidConfig` error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a `SandboxUnavailable` error for the given phase.
    pub fn sandbox_unavailable(phase: Phase, message: impl Into<String>) -> Self {
        Self::SandboxUnavailable {
            phase,
            message: message.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates an `InstallFailed` error.
    pub fn install_failed(message: impl Into<String>) -> Self {
        Self::InstallFailed {
            message: message.into(),
        }
    }

    /// Creates a `DirtyState` error.
    pub fn dirty_state(message: impl Into<String>) -> Self {
        Self::DirtyState {
            message: message.into(),
        }
    }

    /// Creates a `NoChanges` error.
    pub fn no_changes(message: impl Into<String>) -> Self {
        Self::NoChanges {
            message: message.into(),
        }
    }

    /// Creates a `PublishFailed` error.
    pub fn publish_failed(message: impl Into<String>) -> Self {
        Self::PublishFailed {
            message: message.into(),
        }
    }

    /// Creates a `Docker` error for the given phase.
    pub fn docker(phase: Phase, message: impl Into<String>) -> Self {
        Self::Docker {
            phase,
            message: message.into(),
        }
    }

    /// Returns true if this is a timeout error.
    ///
    /// Timeouts are recoverable: the channel stays usable after the
    /// runaway command has been killed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if this is a sandbox availability error.
    pub fn is_sandbox_unavailable(&self) -> bool {
        matches!(self, Self::SandboxUnavailable { .. })
    }

    /// Returns true if this is a configuration error.
    pub fn is_invalid_config(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. })
    }

    /// Returns true if this error means there was nothing to publish.
    pub fn is_no_changes(&self) -> bool {
        matches!(self, Self::NoChanges { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_error() {
        let err = EnvError::invalid_config("data_path is empty");
        assert!(err.is_invalid_config());
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "Invalid configuration: data_path is empty");
    }

    #[test]
    fn test_sandbox_unavailable_error() {
        let err = EnvError::sandbox_unavailable(Phase::Resolve, "daemon not running");
        assert!(err.is_sandbox_unavailable());
        assert_eq!(
            err.to_string(),
            "Sandbox unavailable during resolve: daemon not running"
        );
    }

    #[test]
    fn test_timeout_error() {
        let err = EnvError::timeout(Duration::from_secs(25));
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Command timed out after 25 seconds");
    }

    #[test]
    fn test_install_failed_error() {
        let err = EnvError::install_failed("apt-get exited with 100");
        assert_eq!(
            err.to_string(),
            "Environment install failed: apt-get exited with 100"
        );
    }

    #[test]
    fn test_publish_errors() {
        let dirty = EnvError::dirty_state("git status exited with 128");
        let none = EnvError::no_changes("working tree matches base commit");
        let publish = EnvError::publish_failed("GitHub API returned 403");

        assert!(none.is_no_changes());
        assert!(!dirty.is_no_changes());
        assert_eq!(
            dirty.to_string(),
            "Repository state could not be determined: git status exited with 128"
        );
        assert_eq!(
            none.to_string(),
            "No changes to publish: working tree matches base commit"
        );
        assert_eq!(
            publish.to_string(),
            "Publishing failed: GitHub API returned 403"
        );
    }

    #[test]
    fn test_docker_error_phase_rendering() {
        let err = EnvError::docker(Phase::Execute, "exec create failed");
        assert_eq!(
            err.to_string(),
            "Docker error during execute: exec create failed"
        );
        assert_eq!(Phase::Resolve.to_string(), "resolve");
        assert_eq!(Phase::Install.to_string(), "install");
        assert_eq!(Phase::Publish.to_string(), "publish");
    }

    #[test]
    fn test_error_variants_are_distinct() {
        let timeout = EnvError::timeout(Duration::from_secs(60));
        let unavailable = EnvError::sandbox_unavailable(Phase::Execute, "gone");
        let config = EnvError::invalid_config("bad");

        assert!(timeout.is_timeout());
        assert!(!timeout.is_sandbox_unavailable());
        assert!(!timeout.is_invalid_config());

        assert!(!unavailable.is_timeout());
        assert!(unavailable.is_sandbox_unavailable());

        assert!(!config.is_timeout());
        assert!(config.is_invalid_config());
    }
}

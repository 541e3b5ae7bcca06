//! Append-only record of agent actions and observations.
//!
//! A trajectory is what ran inside the sandbox: each step pairs the
//! command (or higher-level action) with the output the agent saw. The
//! pull request publisher renders the tail of the trajectory into the PR
//! body so reviewers can retrace the run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One action/observation pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryStep {
    /// What the agent did.
    pub action: String,
    /// What the agent saw in response.
    pub observation: String,
    /// When the step was recorded.
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

/// Ordered list of steps. Steps can be appended but never reordered or
/// removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trajectory {
    steps: Vec<TrajectoryStep>,
}

impl Trajectory {
    /// Creates an empty trajectory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step at the end.
    pub fn record(&mut self, action: impl Into<String>, observation: impl Into<String>) {
        self.steps.push(TrajectoryStep {
            action: action.into(),
            observation: observation.into(),
            recorded_at: Utc::now(),
        });
    }

    /// All steps, oldest first.
    pub fn steps(&self) -> &[TrajectoryStep] {
        &self.steps
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Load a trajectory from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read trajectory file: {}", path.display()))?;

        let trajectory: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse trajectory file: {}", path.display()))?;

        Ok(trajectory)
    }

    /// Save the trajectory to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize trajectory")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write trajectory file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_preserves_order() {
        let mut trajectory = Trajectory::new();
        trajectory.record("ls", "Cargo.toml src");
        trajectory.record("cat src/lib.rs", "pub mod env;");
        trajectory.record("pytest", "3 passed");

        assert_eq!(trajectory.len(), 3);
        assert!(!trajectory.is_empty());
        assert_eq!(trajectory.steps()[0].action, "ls");
        assert_eq!(trajectory.steps()[1].observation, "pub mod env;");
        assert_eq!(trajectory.steps()[2].action, "pytest");
    }

    #[test]
    fn test_trajectory_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trajectory.json");

        let mut trajectory = Trajectory::new();
        trajectory.record("grep -rn bug src/", "src/env.rs:42: // bug");
        trajectory.record("git diff", "+fixed");

        trajectory.save(&path).unwrap();
        let loaded = Trajectory::load(&path).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.steps()[0].action, "grep -rn bug src/");
        assert_eq!(loaded.steps()[1].observation, "+fixed");
    }

    #[test]
    fn test_load_bare_step_list_without_timestamps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trajectory.json");
        fs::write(
            &path,
            r#"[{"action": "ls", "observation": "README.md"}]"#,
        )
        .unwrap();

        let loaded = Trajectory::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.steps()[0].action, "ls");
    }

    #[test]
    fn test_load_nonexistent_fails() {
        let dir = tempdir().unwrap();
        assert!(Trajectory::load(&dir.path().join("missing.json")).is_err());
    }
}

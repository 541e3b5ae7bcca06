//! Task and repository source plumbing.
//!
//! Resolves the configured `data_path`/`repo_path` pair into typed
//! sources and builds the git command plans the lifecycle manager runs
//! inside the sandbox. Everything here is pure string work; execution
//! happens elsewhere.

use std::path::PathBuf;

use crate::config::{CloneMethod, EnvConfig};
use crate::error::{EnvError, Result};

/// A GitHub issue reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRef {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Issue number.
    pub number: u64,
}

/// Where the task statement comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSource {
    /// A local problem statement file.
    File(PathBuf),
    /// A remote GitHub issue.
    Issue(IssueRef),
}

/// Where the repository comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoSource {
    /// A local directory, uploaded into the sandbox as an archive.
    Local(PathBuf),
    /// A remote GitHub repository, cloned inside the sandbox.
    Remote {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
    },
}

/// Parses `https://github.com/<owner>/<repo>/issues/<n>`.
pub fn parse_issue_url(url: &str) -> Option<IssueRef> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://github.com/")
        .or_else(|| url.strip_prefix("http://github.com/"))?;

    let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    match segments.as_slice() {
        [owner, repo, "issues", number] if !owner.is_empty() && !repo.is_empty() => {
            Some(IssueRef {
                owner: (*owner).to_string(),
                repo: (*repo).to_string(),
                number: number.parse().ok()?,
            })
        }
        _ => None,
    }
}

/// Parses the `owner/repo` out of a GitHub remote URL, in any of the
/// three common forms (https, ssh, scp-like).
pub fn parse_github_remote(url: &str) -> Option<(String, String)> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://github.com/")
        .or_else(|| url.strip_prefix("http://github.com/"))
        .or_else(|| url.strip_prefix("ssh://git@github.com/"))
        .or_else(|| url.strip_prefix("git@github.com:"))?;

    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);

    let segments: Vec<&str> = rest.split('/').collect();
    match segments.as_slice() {
        [owner, repo] if !owner.is_empty() && !repo.is_empty() => {
            Some(((*owner).to_string(), (*repo).to_string()))
        }
        _ => None,
    }
}

/// Resolves the configured sources into typed task and repository
/// origins. Assumes the config already passed validation.
pub fn resolve_sources(config: &EnvConfig) -> Result<(TaskSource, RepoSource)> {
    match parse_issue_url(&config.data_path) {
        Some(issue) => {
            let repo = if config.repo_path.trim().is_empty() {
                RepoSource::Remote {
                    owner: issue.owner.clone(),
                    repo: issue.repo.clone(),
                }
            } else {
                RepoSource::Local(PathBuf::from(config.expanded_repo_path()?))
            };
            Ok((TaskSource::Issue(issue), repo))
        }
        None => Ok((
            TaskSource::File(PathBuf::from(&config.data_path)),
            RepoSource::Local(PathBuf::from(config.expanded_repo_path()?)),
        )),
    }
}

/// Directory name the repository occupies inside the sandbox (under `/`).
pub fn repo_dir_name(source: &RepoSource) -> Result<String> {
    match source {
        RepoSource::Local(path) => path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string)
            .ok_or_else(|| {
                EnvError::invalid_config(format!(
                    "repository path {} has no usable directory name",
                    path.display()
                ))
            }),
        RepoSource::Remote { repo, .. } => Ok(repo.clone()),
    }
}

/// Absolute path of the repository inside the sandbox.
pub fn repo_dir(name: &str) -> String {
    format!("/{name}")
}

/// Command that exits zero when the repository already sits inside the
/// sandbox.
pub fn repo_present_probe(name: &str) -> String {
    format!("test -d {}/.git", quote(&repo_dir(name)))
}

/// Commands that clone a remote repository into place.
pub fn clone_commands(
    owner: &str,
    repo: &str,
    name: &str,
    method: CloneMethod,
    base_commit: Option<&str>,
) -> Vec<String> {
    let url = format!("https://github.com/{owner}/{repo}.git");
    let dest = repo_dir(name);

    match method {
        CloneMethod::Shallow => {
            let mut commands = vec![format!(
                "git clone --depth 1 {} {}",
                quote(&url),
                quote(&dest)
            )];
            if let Some(commit) = base_commit {
                // A shallow clone does not carry arbitrary commits; fetch
                // the pinned one explicitly so the state reset can reach it.
                commands.push(format!(
                    "git -C {} fetch --depth 1 origin {}",
                    quote(&dest),
                    quote(commit)
                ));
            }
            commands
        }
        CloneMethod::Full => {
            vec![format!("git clone {} {}", quote(&url), quote(&dest))]
        }
    }
}

/// Commands that force the checkout to a consistent tree at the base
/// revision, run on every reset regardless of how the repo got there.
pub fn state_reset_commands(name: &str, base_commit: Option<&str>) -> Vec<String> {
    let dest = repo_dir(name);
    let rev = base_commit.unwrap_or("HEAD");

    vec![
        format!("git config --global --add safe.directory {}", quote(&dest)),
        format!("git -C {} reset --hard {}", quote(&dest), quote(rev)),
        format!("git -C {} clean -fdq", quote(&dest)),
    ]
}

fn quote(s: &str) -> String {
    shell_words::quote(s).into_owned()
}

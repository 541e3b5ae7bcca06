//! Reproducible Docker task environments for patch-producing agents.
//!
//! patchbox puts an agent's task — a repository plus a problem
//! statement — inside a Docker sandbox it can freely modify, runs the
//! agent's commands through a persistent shell, and publishes the
//! resulting diff as a pull request.
//!
//! The pieces:
//! - [`env::TaskEnv`] drives the sandbox lifecycle: resolve a
//!   container, materialize the repository, install the task
//!   environment, run commands, tear down.
//! - [`channel`] delivers commands into the sandbox, either through one
//!   long-lived shell or one exec per command.
//! - [`install`] builds the task environment from a setup script or a
//!   structured manifest, with fingerprint-keyed image caching.
//! - [`pr`] turns the sandbox's diff into a branch, commit, and pull
//!   request.

pub mod channel;
pub mod commands;
pub mod config;
pub mod env;
pub mod error;
pub mod hooks;
pub mod install;
pub mod pr;
pub mod repo;
pub mod runtime;
pub mod trajectory;

pub use config::EnvConfig;
pub use env::{EnvState, TaskEnv};
pub use error::{EnvError, Result};

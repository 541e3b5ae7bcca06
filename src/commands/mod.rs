//! CLI command implementations.
//!
//! Each submodule implements one patchbox CLI command with pure core
//! logic separated from IO for testability.

pub mod exec;
pub mod images;
pub mod pr;
pub mod shell;

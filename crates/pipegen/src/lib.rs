//! pipegen command line interface
//!
//! The binary reads the Buildkite environment of the running build, computes
//! its pipeline with [`pipegen_ci`] and prints it for
//! `buildkite-agent pipeline upload`.

pub mod cli;
pub mod commands;
pub mod tracing;

pub use cli::{Cli, CliError, Commands, exit_code_for, render_error};
pub use commands::{Context, execute, write_output};

//! Pipeline generation for the Sourcegraph monorepo
//!
//! A build is described by its Buildkite environment. [`Config::compute`]
//! classifies it into a [`RunType`] and a [`Diff`] of the changed files;
//! [`generate_pipeline`] turns that into a Buildkite [`Pipeline`] built from
//! the step types in [`steps`].
//!
//! ```no_run
//! use pipegen_ci::{Config, GitCli, Settings, generate_pipeline};
//! use std::path::Path;
//!
//! let git = GitCli::new(".");
//! let config = Config::from_env(&git, Path::new("."))?;
//! let pipeline = generate_pipeline(&config, &Settings::default(), &git)?;
//! println!("{}", pipegen_buildkite::to_json(&pipeline)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bazel;
pub mod changed;
pub mod config;
pub mod error;
pub mod generate;
pub mod git;
pub mod images;
pub mod operations;
pub mod render;
pub mod runtype;
pub mod settings;
pub mod steps;

pub use changed::{ChangedFiles, Diff, parse_diff, parse_diff_in};
pub use config::{Config, MessageFlags};
pub use error::{Error, Result};
pub use generate::{
    CoreTestOptions, core_test_operations, generate_pipeline, operations_for, pipeline_env,
};
pub use git::{Git, GitCli, StaticGit};
pub use operations::{Operation, Set};
pub use render::{render_docs, render_preview};
pub use runtype::{RunType, branch_for_run_type};
pub use settings::Settings;

pub use pipegen_buildkite::Pipeline;

//! Buildkite pipeline model for pipegen
//!
//! This crate owns everything that is specific to Buildkite's pipeline schema:
//! the serialized step types, the option vocabulary used to describe a step,
//! and a builder that applies pipeline-wide defaults before the document is
//! written out for `buildkite-agent pipeline upload`.
//!
//! # Example
//!
//! ```
//! use pipegen_buildkite::{CacheSettings, PipelineBuilder, StepDefault, StepOpt};
//!
//! let mut builder = PipelineBuilder::new(CacheSettings::default())
//!     .with_env("CI", "true")
//!     .with_default(StepDefault::Timeout(60))
//!     .with_default(StepDefault::queue("stateless"));
//!
//! builder.add_step(":go: Build", [StepOpt::cmd("./dev/ci/go-build.sh")]);
//! builder.add_wait();
//!
//! let pipeline = builder.build()?;
//! let json = pipegen_buildkite::to_json(&pipeline)?;
//! assert!(json.contains("go-build.sh"));
//! # Ok::<(), pipegen_buildkite::Error>(())
//! ```
//!
//! # Step defaults
//!
//! | Default | Effect |
//! |---------|--------|
//! | `Timeout(n)` | `timeout_in_minutes: n` when the step runs commands |
//! | `Agent { key, value }` | `agents: { key: value }` unless already targeted |
//! | `AgentLostRetry` | retry once on exit status `-1` |
//! | `Profiling` | prefix every command with `env time -v` |

pub mod cache;
pub mod error;
pub mod pipeline;
pub mod schema;
pub mod step;

pub use cache::{CacheBackend, CacheOptions, CacheSettings};
pub use error::{Error, Result};
pub use pipeline::{
    PipelineBuilder, StepDefault, ensure_unique_keys, to_json, to_yaml, write_json, write_yaml,
};
pub use schema::{BuildOptions, CommandStep, Pipeline, Step};
pub use step::{
    AnnotatedCmdOpts, AnnotationOpts, AnnotationType, SlackStepNotify, StepOpt, TestReportOpts,
    TriggerOpt,
};

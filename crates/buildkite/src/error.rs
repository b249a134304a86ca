//! Error types for pipeline construction and output.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while finishing or writing a pipeline.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Two steps share the same key.
    #[error("duplicate step key {key:?} used by {count} steps")]
    #[diagnostic(
        code(pipegen::buildkite::duplicate_key),
        help("Step keys must be unique across the whole pipeline, including grouped steps")
    )]
    DuplicateKey {
        /// The repeated key
        key: String,
        /// How many steps carry it
        count: usize,
    },

    /// Failed to serialize the pipeline as JSON.
    #[error("failed to serialize pipeline as JSON")]
    #[diagnostic(code(pipegen::buildkite::json))]
    Json(#[from] serde_json::Error),

    /// Failed to serialize the pipeline as YAML.
    #[error("failed to serialize pipeline as YAML")]
    #[diagnostic(code(pipegen::buildkite::yaml))]
    Yaml(#[from] serde_yaml::Error),

    /// Failed to write the pipeline to its destination.
    #[error("failed to write pipeline")]
    #[diagnostic(code(pipegen::buildkite::io))]
    Io(#[from] std::io::Error),
}

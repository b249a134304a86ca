//! Error types for pipeline generation.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline generation.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while computing the build configuration or
/// assembling the pipeline.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// The branch does not carry the argument its run type needs.
    #[error("invalid branch {branch:?}: {message}")]
    #[diagnostic(
        code(pipegen::ci::branch_argument),
        help("Branches of this run type look like `<prefix>/<argument>/<anything>`")
    )]
    BranchArgument {
        /// The branch being built
        branch: String,
        /// What was wrong with it
        message: String,
    },

    /// An image patch branch names an image that is not built here.
    #[error("no image {image:?} found")]
    #[diagnostic(
        code(pipegen::ci::unknown_image),
        help("Use one of the images listed by `pipegen docs`")
    )]
    UnknownImage {
        /// The requested image
        image: String,
    },

    /// A version could not be parsed as semver.
    #[error("invalid version {version:?}")]
    #[diagnostic(
        code(pipegen::ci::invalid_version),
        help("Versions must follow semantic versioning, e.g. 5.1.0")
    )]
    InvalidVersion {
        /// The rejected version
        version: String,
        /// Parser error
        #[source]
        source: semver::Error,
    },

    /// The `!bazel` directive in the commit message was rejected.
    #[error("cannot generate bazel-do: {reason}")]
    #[diagnostic(
        code(pipegen::ci::bazel_command),
        help("Use `!bazel build|test <targets> [flags]` with allow-listed flags only")
    )]
    BazelCommand {
        /// The rejected command
        command: String,
        /// Why it was rejected
        reason: String,
    },

    /// A bazel-do build without any `!bazel` directive.
    #[error("no bazel command was given")]
    #[diagnostic(
        code(pipegen::ci::missing_bazel_command),
        help("Add a line starting with `!bazel` to the commit message")
    )]
    MissingBazelCommand,

    /// None of the commits that must be present are ancestors of HEAD.
    #[error(
        "branch {branch:?} at commit {commit} does not include any of these commits: {}",
        .expected.join(", ")
    )]
    #[diagnostic(
        code(pipegen::ci::missing_commit),
        help("Rebase onto the latest main to get the latest CI fixes.\n{details}")
    )]
    MissingCommit {
        /// The branch being built
        branch: String,
        /// The commit being built
        commit: String,
        /// Commits of which at least one must be included
        expected: Vec<String>,
        /// Output of each failed ancestry check
        details: String,
    },

    /// A git invocation failed.
    #[error("git {command} failed: {message}")]
    #[diagnostic(code(pipegen::ci::git))]
    Git {
        /// The git arguments
        command: String,
        /// Stderr or spawn error
        message: String,
    },

    /// Failed to read something from the repository.
    #[error("failed to read {}", .path.display())]
    #[diagnostic(code(pipegen::ci::io))]
    Io {
        /// The path being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Invalid settings file.
    #[error("invalid settings in {}: {message}", .path.display())]
    #[diagnostic(
        code(pipegen::ci::settings),
        help("See the Settings section of the readme for the accepted keys")
    )]
    Settings {
        /// The settings file
        path: PathBuf,
        /// Parser error
        message: String,
    },

    /// A run type name that does not select a special run type.
    #[error("unsupported run type {name:?}")]
    #[diagnostic(
        code(pipegen::ci::unsupported_run_type),
        help("Supported run types: {supported}")
    )]
    UnsupportedRunType {
        /// The name given
        name: String,
        /// Comma separated names that would have been accepted
        supported: String,
    },

    /// Failed to encode build metadata.
    #[error("failed to encode build metadata")]
    #[diagnostic(code(pipegen::ci::metadata))]
    Metadata(#[from] serde_json::Error),

    /// The assembled pipeline is invalid.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Pipeline(#[from] pipegen_buildkite::Error),
}

impl Error {
    /// Create an I/O error for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a git error.
    pub fn git(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a bazel command error.
    pub fn bazel(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BazelCommand {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

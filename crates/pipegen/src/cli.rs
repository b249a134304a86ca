//! Command line definition and error reporting
//!
//! Errors are grouped by exit code: [`EXIT_CLI`] for bad arguments or
//! settings, [`EXIT_EVAL`] when no pipeline can be produced.

use crate::tracing::{LogLevel, TracingFormat};
use clap::{Parser, Subcommand, ValueEnum};
use miette::{Diagnostic, Report};
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the CLI application
pub const EXIT_OK: i32 = 0;
/// CLI or configuration error exit code
pub const EXIT_CLI: i32 = 2;
/// Pipeline generation error exit code
pub const EXIT_EVAL: i32 = 3;

/// CLI-specific error types with proper exit code mapping
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum CliError {
    /// CLI or configuration error (exit code 2)
    #[error("CLI/configuration error: {message}")]
    #[diagnostic(code(pipegen::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// The build cannot be turned into a pipeline (exit code 3)
    #[error("Generation error: {message}")]
    #[diagnostic(code(pipegen::cli::eval))]
    Eval {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Other unexpected error (exit code 3)
    #[error("Unexpected error: {message}")]
    #[diagnostic(code(pipegen::cli::other))]
    Other {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
}

impl CliError {
    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new configuration error with help text
    #[must_use]
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create a new generation error
    #[must_use]
    pub fn eval(message: impl Into<String>) -> Self {
        Self::Eval {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new other error
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
            help: None,
        }
    }

    /// Add help text to an existing error, returning a new error with the help text set.
    #[must_use]
    pub fn with_help(self, help_text: impl Into<String>) -> Self {
        let help = Some(help_text.into());
        match self {
            Self::Config { message, .. } => Self::Config { message, help },
            Self::Eval { message, .. } => Self::Eval { message, help },
            Self::Other { message, .. } => Self::Other { message, help },
        }
    }
}

/// Convert `pipegen_ci::Error` to the matching `CliError` variant.
///
/// - Settings and branch naming problems -> Config (exit code 2)
/// - Git and I/O failures -> Other (exit code 3)
/// - Everything refusing to produce a pipeline -> Eval (exit code 3)
impl From<pipegen_ci::Error> for CliError {
    fn from(err: pipegen_ci::Error) -> Self {
        use pipegen_ci::Error;

        let help = err.help().map(|help| help.to_string());
        let message = err.to_string();
        let converted = match err {
            Error::Settings { .. } | Error::BranchArgument { .. } | Error::UnsupportedRunType { .. } => {
                Self::config(message)
            }
            Error::Git { .. } | Error::Io { .. } => Self::other(message),
            Error::UnknownImage { .. }
            | Error::InvalidVersion { .. }
            | Error::BazelCommand { .. }
            | Error::MissingBazelCommand
            | Error::MissingCommit { .. }
            | Error::Metadata(_)
            | Error::Pipeline(_) => Self::eval(message),
        };
        match help {
            Some(help) => converted.with_help(help),
            None => converted,
        }
    }
}

impl From<pipegen_buildkite::Error> for CliError {
    fn from(err: pipegen_buildkite::Error) -> Self {
        Self::other(err.to_string())
    }
}

impl From<io::Error> for CliError {
    fn from(err: io::Error) -> Self {
        Self::other(format!("cannot write output: {err}"))
    }
}

/// Map CLI error to appropriate exit code
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. } => EXIT_CLI,
        CliError::Eval { .. } | CliError::Other { .. } => EXIT_EVAL,
    }
}

/// Render an error on stderr with miette
#[allow(clippy::print_stderr)]
pub fn render_error(err: &CliError) {
    let report = Report::new(err.clone());
    eprintln!("{report:?}");
    let _ = io::stderr().flush();
}

/// Serialization of the generated pipeline
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum PipelineFormat {
    /// JSON, as uploaded by the agent
    #[default]
    Json,
    /// YAML
    Yaml,
}

/// Generates the Buildkite pipeline of the current build.
///
/// Reads the build from the `BUILDKITE_*` environment and prints the pipeline
/// to upload on stdout.
#[derive(Parser, Debug)]
#[command(name = "pipegen")]
#[command(about = "Generates the Buildkite pipeline of the current build")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute; `generate` when omitted.
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Logging verbosity level.
    #[arg(
        short = 'L',
        long,
        global = true,
        help = "Set logging level",
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    /// Log output format.
    #[arg(long, global = true, default_value = "compact", value_enum)]
    pub log_format: TracingFormat,

    /// Settings file overriding the built-in defaults.
    #[arg(long, global = true, env = "PIPEGEN_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Checkout the build runs in.
    #[arg(long, global = true, default_value = ".")]
    pub repo: PathBuf,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Print the pipeline of the current build.
    Generate {
        /// Output format.
        #[arg(long, value_enum, default_value_t = PipelineFormat::Json)]
        format: PipelineFormat,

        /// Print a markdown summary instead of the pipeline.
        #[arg(long)]
        preview: bool,

        /// Read the changed files from this file, one per line, instead of
        /// asking git.
        #[arg(long, value_name = "FILE")]
        changed_files: Option<PathBuf>,
    },

    /// Print the reference of every run type and diff category.
    Docs,

    /// Print the run type of a build.
    Runtype {
        /// Branch being built.
        #[arg(long, env = "BUILDKITE_BRANCH", default_value = "")]
        branch: String,

        /// Tag being built.
        #[arg(long, env = "BUILDKITE_TAG", default_value = "")]
        tag: String,
    },

    /// Print the branch to push to get a special build.
    Branch {
        /// Run type prefix, e.g. `main-dry-run` or `docker-images-patch`.
        run_type: String,

        /// Argument of run types that need one, e.g. the image to patch.
        argument: Option<String>,

        /// The branch to build.
        #[arg(long)]
        current: String,
    },
}

impl Commands {
    /// What runs when no subcommand is given
    #[must_use]
    pub const fn default_generate() -> Self {
        Self::Generate {
            format: PipelineFormat::Json,
            preview: false,
            changed_files: None,
        }
    }

    /// Name used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Generate { .. } => "generate",
            Self::Docs => "docs",
            Self::Runtype { .. } => "runtype",
            Self::Branch { .. } => "branch",
        }
    }
}

/// Parse the process arguments
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}

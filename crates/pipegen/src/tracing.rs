//! Logging for the pipegen CLI
//!
//! Logs always go to stderr: stdout carries the generated pipeline, which is
//! piped straight into `buildkite-agent pipeline upload`.

use std::io;
use std::sync::OnceLock;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};
use uuid::Uuid;

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TracingFormat {
    /// Multi-line, human readable
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// One JSON object per event, with the span context
    Json,
}

/// Lowest level logged by the pipegen crates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    /// Everything
    Trace,
    /// Operation selection and step details
    Debug,
    /// One line per generated pipeline
    Info,
    /// Recoverable problems only
    #[default]
    Warn,
    /// Failures only
    Error,
}

impl LogLevel {
    /// Filter directives enabling this level for every pipegen crate
    #[must_use]
    pub fn directives(self) -> String {
        let level = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        format!("pipegen={level},pipegen_ci={level},pipegen_buildkite={level}")
    }
}

static CORRELATION_ID: OnceLock<Uuid> = OnceLock::new();

/// Identifier shared by every log line of this invocation
pub fn correlation_id() -> Uuid {
    *CORRELATION_ID.get_or_init(Uuid::new_v4)
}

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init_tracing(format: TracingFormat, level: LogLevel) -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.directives()))
        .map_err(|e| miette::miette!("invalid log filter: {e}"))?;

    let output: Box<dyn Layer<Registry> + Send + Sync> = match format {
        TracingFormat::Pretty => fmt::layer().pretty().with_writer(io::stderr).boxed(),
        TracingFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(io::stderr)
            .boxed(),
        TracingFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .map_err(|e| miette::miette!("cannot install log subscriber: {e}"))?;

    tracing::debug!(
        correlation_id = %correlation_id(),
        version = env!("CARGO_PKG_VERSION"),
        ?format,
        "logging to stderr"
    );
    Ok(())
}

/// Span covering one command, tagged with the correlation ID
#[macro_export]
macro_rules! command_span {
    ($command:expr) => {
        tracing::info_span!(
            "command",
            command = %$command,
            correlation_id = %$crate::tracing::correlation_id(),
            start_time = %chrono::Utc::now().to_rfc3339(),
        )
    };
}

//! `!bazel` directives
//!
//! A bazel-do build runs the bazel command written in its commit message. The
//! message is untrusted and the command ends up in a shell, so it is checked
//! against a small grammar before use.

use crate::error::{Error, Result};
use crate::operations::Operation;
use pipegen_buildkite::{PipelineBuilder, StepOpt};
use regex::Regex;
use std::sync::LazyLock;
use tracing::info;

/// Prefix of a directive line
pub const DIRECTIVE: &str = "!bazel";

/// Characters a shell would interpret
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '$', '`', '<', '>', '('];

/// Flags a directive may pass
pub const ALLOWED_FLAGS: &[&str] = &[
    "--runs_per_test",
    "--nobuild",
    "--local_test_jobs",
    "--test_arg",
    "--nocache_test_results",
    "--test_tag_filters",
    "--test_timeout",
];

const BAZELRC_FLAGS: &str =
    "--bazelrc=.bazelrc --bazelrc=.aspect/bazelrc/ci.bazelrc --bazelrc=.aspect/bazelrc/ci.sourcegraph.bazelrc";

static FLAG_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"--\w+").ok());

/// The command of the first directive line in `message`
#[must_use]
pub fn extract_command(message: &str) -> Option<&str> {
    message
        .lines()
        .map(str::trim_start)
        .find_map(|line| line.strip_prefix(DIRECTIVE))
        .map(str::trim)
}

/// Check that `command` is a bazel `build` or `test` with allowed flags only
pub fn verify_bazel_command(command: &str) -> Result<()> {
    if let Some(c) = command.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(Error::bazel(command, format!("unauthorized input {c:?}")));
    }

    let parts: Vec<&str> = command.split(' ').collect();
    if parts.len() < 2 {
        return Err(Error::bazel(command, "expected a verb and a target"));
    }
    if !matches!(parts[0], "build" | "test") {
        return Err(Error::bazel(
            command,
            format!("{:?} is not allowed, use build or test", parts[0]),
        ));
    }

    let Some(flags) = FLAG_PATTERN.as_ref() else {
        return Err(Error::bazel(command, "cannot scan for flags"));
    };
    for flag in flags.find_iter(command).map(|m| m.as_str()) {
        if !ALLOWED_FLAGS.contains(&flag) {
            return Err(Error::bazel(command, format!("flag {flag} is not allowed")));
        }
    }

    Ok(())
}

/// Runs a validated bazel command on the bazel queue
#[derive(Debug, Clone)]
pub struct BazelCommand {
    command: String,
    queue: String,
}

impl BazelCommand {
    /// Build the step for the directive in `message`
    pub fn from_message(message: &str, queue: impl Into<String>) -> Result<Self> {
        let command = extract_command(message).ok_or(Error::MissingBazelCommand)?;
        verify_bazel_command(command)?;
        info!(command, "running bazel command from commit message");
        Ok(Self {
            command: command.to_string(),
            queue: queue.into(),
        })
    }

    /// The validated command, without `bazel`
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Operation for BazelCommand {
    fn name(&self) -> String {
        format!("bazel {}", self.command)
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            format!(":bazel::desktop_computer: bazel {}", self.command),
            [
                StepOpt::key("bazel-do"),
                StepOpt::agent("queue", &self.queue),
                StepOpt::cmd(format!("bazel {BAZELRC_FLAGS} {}", self.command)),
            ],
        );
    }
}

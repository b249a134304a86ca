//! Step options
//!
//! A step is described by its label plus an ordered list of [`StepOpt`]s.
//! Options are plain data so callers can inspect them before they are applied;
//! [`crate::PipelineBuilder`] turns them into a [`CommandStep`].

use crate::cache::{CacheOptions, CacheSettings};
use crate::schema::{
    AutomaticRetryRule, BuildOptions, CommandStep, ExitStatus, ManualRetry, RetryConfig,
    SlackNotify, SoftFail, SoftFailStatus, StepNotify, TriggerStep,
};

/// Script that runs a command and turns its output into build annotations.
pub const ANNOTATED_COMMAND_SCRIPT: &str = "./enterprise/dev/ci/scripts/annotated-command.sh";

/// Condition that keeps a step off draft pull requests.
pub const READY_FOR_REVIEW_CONDITION: &str = "build.pull_request.draft != true";

/// `./tr` is linked into the checkout by the agent hooks and records a trace span
/// for the command it wraps.
#[must_use]
pub fn traced_cmd(command: &str) -> String {
    format!("./tr {command}")
}

/// Severity of annotations produced by an annotated command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnotationType {
    /// Error annotation
    #[default]
    Error,
    /// Warning annotation
    Warning,
    /// Informational annotation
    Info,
}

impl AnnotationType {
    /// The name used by `buildkite-agent annotate --style`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// Annotation settings for an annotated command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationOpts {
    /// Annotation severity
    pub kind: AnnotationType,
    /// Prefix annotations with the names of the files that produced them
    pub include_names: bool,
    /// Share one annotation context between several jobs
    pub multi_job_context: Option<String>,
}

/// Test report upload settings for an annotated command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReportOpts {
    /// Environment variable holding the test analytics suite key
    pub test_suite_key_variable_name: String,
}

/// Options for [`StepOpt::AnnotatedCmd`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotatedCmdOpts {
    /// Annotations to create from the command output
    pub annotations: Option<AnnotationOpts>,
    /// Test reports to upload
    pub test_reports: Option<TestReportOpts>,
}

impl AnnotatedCmdOpts {
    /// Error annotations with default settings.
    #[must_use]
    pub fn annotations() -> Self {
        Self {
            annotations: Some(AnnotationOpts::default()),
            test_reports: None,
        }
    }

    /// Upload test reports under the suite key held in `variable`.
    #[must_use]
    pub fn test_reports(variable: impl Into<String>) -> Self {
        Self {
            annotations: None,
            test_reports: Some(TestReportOpts {
                test_suite_key_variable_name: variable.into(),
            }),
        }
    }

    fn annotate_env(&self) -> String {
        self.annotations.as_ref().map_or_else(String::new, |opts| {
            let mut flags = format!("-t {}", opts.kind.as_str());
            if let Some(context) = &opts.multi_job_context {
                flags.push_str(" -c ");
                flags.push_str(context);
            }
            format!("{} {}", opts.include_names, flags)
        })
    }

    fn test_report_env(&self) -> String {
        self.test_reports
            .as_ref()
            .map(|opts| opts.test_suite_key_variable_name.clone())
            .unwrap_or_default()
    }
}

/// Slack notification sent when a step finishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackStepNotify {
    /// Message to post
    pub message: String,
    /// Channel to post to
    pub channel_name: String,
    /// Only notify when the step failed
    pub only_on_failure: bool,
}

/// A single option applied to a command step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOpt {
    /// Traced command (see [`traced_cmd`])
    Cmd(String),
    /// Command used verbatim
    RawCmd(String),
    /// Command whose output is turned into annotations and test reports
    AnnotatedCmd(String, AnnotatedCmdOpts),
    /// Environment variable
    Env(String, String),
    /// Step key
    Key(String),
    /// Keys this step waits for
    DependsOn(Vec<String>),
    /// Run even if a dependency failed
    AllowDependencyFailure,
    /// Exit codes treated as soft failures; empty means any failure
    SoftFail(Vec<i32>),
    /// Retry any failure up to the given limit
    AutomaticRetry(u32),
    /// Retry a specific exit status up to the given limit
    AutomaticRetryStatus(u32, i32),
    /// Forbid manual retries, with the reason shown in the UI
    DisableManualRetry(String),
    /// Artifact globs uploaded after the step
    ArtifactPaths(Vec<String>),
    /// Agent targeting rule
    Agent(String, String),
    /// Plugin and its configuration
    Plugin(String, serde_json::Value),
    /// Cache some paths between builds
    Cache(CacheOptions),
    /// Skip draft pull requests unless forced
    IfReadyForReview(bool),
    /// Skip the step with a reason
    Skip(String),
    /// Limit concurrency within a named group
    Concurrency {
        /// Group name
        group: String,
        /// Maximum concurrent jobs
        limit: u32,
    },
    /// Number of parallel jobs
    Parallelism(u32),
    /// Timeout in minutes
    Timeout(u32),
    /// Slack notification
    SlackStepNotify(SlackStepNotify),
}

impl StepOpt {
    /// Traced command.
    pub fn cmd(command: impl Into<String>) -> Self {
        Self::Cmd(command.into())
    }

    /// Command used verbatim.
    pub fn raw_cmd(command: impl Into<String>) -> Self {
        Self::RawCmd(command.into())
    }

    /// Annotated command.
    pub fn annotated_cmd(command: impl Into<String>, opts: AnnotatedCmdOpts) -> Self {
        Self::AnnotatedCmd(command.into(), opts)
    }

    /// Environment variable.
    pub fn env(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Env(key.into(), value.into())
    }

    /// Step key.
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    /// Single dependency.
    pub fn depends_on(key: impl Into<String>) -> Self {
        Self::DependsOn(vec![key.into()])
    }

    /// Agent targeting rule.
    pub fn agent(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Agent(key.into(), value.into())
    }

    /// Artifact globs.
    pub fn artifact_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ArtifactPaths(paths.into_iter().map(Into::into).collect())
    }

    /// Manual retries are not allowed.
    pub fn disable_manual_retry(reason: impl Into<String>) -> Self {
        Self::DisableManualRetry(reason.into())
    }

    pub(crate) fn apply(self, step: &mut CommandStep, cache: &CacheSettings) {
        match self {
            Self::Cmd(command) => step.command.push(traced_cmd(&command)),
            Self::RawCmd(command) => step.command.push(command),
            Self::AnnotatedCmd(command, opts) => {
                step.env
                    .insert("ANNOTATE_OPTS".to_string(), opts.annotate_env());
                step.env
                    .insert("TEST_REPORT_OPTS".to_string(), opts.test_report_env());
                step.command.push(format!(
                    "{ANNOTATED_COMMAND_SCRIPT} {}",
                    traced_cmd(&command)
                ));
            }
            Self::Env(key, value) => {
                step.env.insert(key, value);
            }
            Self::Key(key) => step.key = Some(key),
            Self::DependsOn(keys) => step.depends_on.extend(keys),
            Self::AllowDependencyFailure => step.allow_dependency_failure = Some(true),
            Self::SoftFail(codes) if codes.is_empty() => step.soft_fail = Some(SoftFail::Any(true)),
            Self::SoftFail(codes) => {
                let mut statuses = match step.soft_fail.take() {
                    Some(SoftFail::ExitStatuses(existing)) => existing,
                    _ => Vec::new(),
                };
                statuses.extend(
                    codes
                        .into_iter()
                        .map(|exit_status| SoftFailStatus { exit_status }),
                );
                step.soft_fail = Some(SoftFail::ExitStatuses(statuses));
            }
            Self::AutomaticRetry(limit) => {
                step.retry.get_or_insert_with(RetryConfig::default).automatic =
                    vec![AutomaticRetryRule {
                        exit_status: ExitStatus::Any,
                        limit,
                    }];
            }
            Self::AutomaticRetryStatus(limit, status) => {
                step.retry
                    .get_or_insert_with(RetryConfig::default)
                    .automatic
                    .push(AutomaticRetryRule {
                        exit_status: ExitStatus::Code(status),
                        limit,
                    });
            }
            Self::DisableManualRetry(reason) => {
                step.retry.get_or_insert_with(RetryConfig::default).manual = Some(ManualRetry {
                    allowed: false,
                    reason: Some(reason),
                });
            }
            Self::ArtifactPaths(paths) => step.artifact_paths.extend(paths),
            Self::Agent(key, value) => {
                step.agents.insert(key, value);
            }
            Self::Plugin(name, config) => {
                step.plugins.insert(name, config);
            }
            Self::Cache(options) => {
                step.plugins
                    .insert(cache.plugin.clone(), cache.plugin_config(&options));
            }
            Self::IfReadyForReview(force) => {
                if !force {
                    step.condition = Some(READY_FOR_REVIEW_CONDITION.to_string());
                }
            }
            Self::Skip(reason) => step.skip = Some(reason),
            Self::Concurrency { group, limit } => {
                step.concurrency_group = Some(group);
                step.concurrency = Some(limit);
            }
            Self::Parallelism(count) => step.parallelism = Some(count),
            Self::Timeout(minutes) => step.timeout_in_minutes = Some(minutes),
            Self::SlackStepNotify(notify) => step.notify.push(StepNotify {
                slack: SlackNotify {
                    channels: vec![notify.channel_name],
                    message: notify.message,
                },
                condition: notify
                    .only_on_failure
                    .then(|| "step.outcome == \"hard_failed\"".to_string()),
            }),
        }
    }
}

/// A single option applied to a trigger step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOpt {
    /// Step key
    Key(String),
    /// Do not wait for the triggered build
    Async(bool),
    /// Attributes of the triggered build
    Build(BuildOptions),
    /// Keys this step waits for
    DependsOn(Vec<String>),
}

impl TriggerOpt {
    pub(crate) fn apply(self, step: &mut TriggerStep) {
        match self {
            Self::Key(key) => step.key = Some(key),
            Self::Async(is_async) => step.is_async = Some(is_async),
            Self::Build(build) => step.build = Some(build),
            Self::DependsOn(keys) => step.depends_on.extend(keys),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_all(opts: Vec<StepOpt>) -> CommandStep {
        let cache = CacheSettings::default();
        let mut step = CommandStep::default();
        for opt in opts {
            opt.apply(&mut step, &cache);
        }
        step
    }

    #[test]
    fn test_cmd_is_traced() {
        let step = apply_all(vec![
            StepOpt::cmd("./dev/ci/go-build.sh"),
            StepOpt::raw_cmd("echo done"),
        ]);
        assert_eq!(step.command, vec!["./tr ./dev/ci/go-build.sh", "echo done"]);
    }

    #[test]
    fn test_annotated_cmd_sets_env() {
        let step = apply_all(vec![StepOpt::annotated_cmd(
            "./dev/ci/go-test.sh",
            AnnotatedCmdOpts {
                annotations: Some(AnnotationOpts {
                    kind: AnnotationType::Warning,
                    include_names: true,
                    multi_job_context: Some("puppeteer".to_string()),
                }),
                test_reports: None,
            },
        )]);

        assert_eq!(
            step.command,
            vec![format!("{ANNOTATED_COMMAND_SCRIPT} ./tr ./dev/ci/go-test.sh")]
        );
        assert_eq!(step.env["ANNOTATE_OPTS"], "true -t warning -c puppeteer");
        assert_eq!(step.env["TEST_REPORT_OPTS"], "");
    }

    #[test]
    fn test_soft_fail_variants() {
        let any = apply_all(vec![StepOpt::SoftFail(vec![])]);
        assert_eq!(any.soft_fail, Some(SoftFail::Any(true)));

        let codes = apply_all(vec![StepOpt::SoftFail(vec![222]), StepOpt::SoftFail(vec![27])]);
        assert_eq!(
            codes.soft_fail,
            Some(SoftFail::ExitStatuses(vec![
                SoftFailStatus { exit_status: 222 },
                SoftFailStatus { exit_status: 27 },
            ]))
        );
    }

    #[test]
    fn test_retry_options_accumulate() {
        let step = apply_all(vec![
            StepOpt::AutomaticRetryStatus(3, 10),
            StepOpt::AutomaticRetryStatus(3, 222),
        ]);
        let retry = step.retry.unwrap();
        assert_eq!(retry.automatic.len(), 2);
        assert_eq!(retry.automatic[1].exit_status, ExitStatus::Code(222));
    }

    #[test]
    fn test_disable_manual_retry() {
        let step = apply_all(vec![StepOpt::disable_manual_retry("restart the pipeline")]);
        assert!(step.manual_retry_disabled());
    }

    #[test]
    fn test_if_ready_for_review() {
        let step = apply_all(vec![StepOpt::IfReadyForReview(false)]);
        assert_eq!(step.condition.as_deref(), Some(READY_FOR_REVIEW_CONDITION));

        let forced = apply_all(vec![StepOpt::IfReadyForReview(true)]);
        assert!(forced.condition.is_none());
    }

    #[test]
    fn test_cache_uses_pipeline_settings() {
        let step = apply_all(vec![StepOpt::Cache(CacheOptions {
            id: "node_modules".to_string(),
            key: "k".to_string(),
            restore_keys: vec![],
            paths: vec!["node_modules".to_string()],
            compress: false,
        })]);
        assert!(step.plugins.contains_key("gencer/cache#v2.4.10"));
    }

    #[test]
    fn test_slack_notify_on_failure() {
        let step = apply_all(vec![StepOpt::SlackStepNotify(SlackStepNotify {
            message: "flake".to_string(),
            channel_name: "code-intel-buildkite".to_string(),
            only_on_failure: true,
        })]);
        assert_eq!(step.notify[0].slack.channels, vec!["code-intel-buildkite"]);
        assert!(step.notify[0].condition.is_some());
    }
}

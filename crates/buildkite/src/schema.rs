//! Buildkite Pipeline Schema Types
//!
//! Defines the data structures serialized into the pipeline document handed to
//! `buildkite-agent pipeline upload`.
//! See: <https://buildkite.com/docs/pipelines/configure/defining-steps>

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// A Buildkite pipeline definition
#[derive(Debug, Clone, Default, Serialize)]
pub struct Pipeline {
    /// Pipeline-level environment variables
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Pipeline steps
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// Iterate over every step, descending into groups.
    pub fn walk(&self) -> impl Iterator<Item = &Step> {
        let mut stack: Vec<&Step> = self.steps.iter().rev().collect();
        std::iter::from_fn(move || {
            let step = stack.pop()?;
            if let Step::Group(group) = step {
                stack.extend(group.steps.iter().rev());
            }
            Some(step)
        })
    }

    /// Iterate over the command steps only, descending into groups.
    pub fn command_steps(&self) -> impl Iterator<Item = &CommandStep> {
        self.walk().filter_map(|step| match step {
            Step::Command(command) => Some(command.as_ref()),
            _ => None,
        })
    }

    /// Find a command step by its key.
    #[must_use]
    pub fn find_step(&self, key: &str) -> Option<&CommandStep> {
        self.command_steps()
            .find(|step| step.key.as_deref() == Some(key))
    }
}

/// A step in a Buildkite pipeline
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Step {
    /// A command step that runs commands
    Command(Box<CommandStep>),
    /// A trigger step that starts a build on another pipeline
    Trigger(TriggerStep),
    /// A wait step to synchronize parallel steps
    Wait(WaitStep),
    /// A group of steps
    Group(GroupStep),
}

impl Step {
    /// The key of the step, if it has one.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Command(step) => step.key.as_deref(),
            Self::Trigger(step) => step.key.as_deref(),
            Self::Group(step) => step.key.as_deref(),
            Self::Wait(_) => None,
        }
    }

    /// The label of the step as displayed by Buildkite.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Command(step) => step.label.as_deref(),
            Self::Trigger(step) => step.label.as_deref(),
            Self::Group(step) => Some(&step.group),
            Self::Wait(_) => None,
        }
    }
}

/// A command step that executes commands
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandStep {
    /// Display label for the step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Unique key for the step (used for `depends_on`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Commands to execute, in order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Environment variables for this step
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Plugins keyed by `name#version`
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins: BTreeMap<String, serde_json::Value>,

    /// Agent targeting rules
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub agents: BTreeMap<String, String>,

    /// Artifact paths to upload
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifact_paths: Vec<String>,

    /// Step dependencies
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Run even when a dependency failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_dependency_failure: Option<bool>,

    /// Concurrency group name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency_group: Option<String>,

    /// Maximum concurrent jobs in the group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,

    /// Number of parallel jobs created from this step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,

    /// Retry configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// Timeout in minutes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_in_minutes: Option<u32>,

    /// Soft fail configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soft_fail: Option<SoftFail>,

    /// Skip the step, optionally with a reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<String>,

    /// Conditional expression evaluated by Buildkite
    #[serde(rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Step notifications
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<StepNotify>,
}

impl CommandStep {
    /// Whether manual retries were explicitly disallowed for this step.
    #[must_use]
    pub fn manual_retry_disabled(&self) -> bool {
        self.retry
            .as_ref()
            .and_then(|retry| retry.manual.as_ref())
            .is_some_and(|manual| !manual.allowed)
    }
}

/// Soft fail configuration: either any failure or specific exit codes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SoftFail {
    /// Any non-zero exit is a soft failure
    Any(bool),
    /// Only the listed exit statuses are soft failures
    ExitStatuses(Vec<SoftFailStatus>),
}

/// A single soft-failing exit status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoftFailStatus {
    /// Exit status allowed to fail softly
    pub exit_status: i32,
}

/// A trigger step that creates a build on another pipeline
#[derive(Debug, Clone, Default, Serialize)]
pub struct TriggerStep {
    /// Slug of the pipeline to trigger
    pub trigger: String,

    /// Display label for the step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Unique key for the step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Continue without waiting for the triggered build
    #[serde(rename = "async", skip_serializing_if = "Option::is_none")]
    pub is_async: Option<bool>,

    /// Attributes of the triggered build
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildOptions>,

    /// Step dependencies
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// Attributes of a build created by a trigger step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildOptions {
    /// Build message
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Commit to build
    #[serde(skip_serializing_if = "String::is_empty")]
    pub commit: String,

    /// Branch to build
    #[serde(skip_serializing_if = "String::is_empty")]
    pub branch: String,

    /// Environment passed to the triggered build
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// A wait step to synchronize parallel steps
#[derive(Debug, Clone, Serialize)]
pub struct WaitStep {
    /// Wait step marker
    pub wait: String,

    /// Continue on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_on_failure: Option<bool>,
}

impl Default for WaitStep {
    fn default() -> Self {
        Self {
            wait: "~".to_string(),
            continue_on_failure: None,
        }
    }
}

/// A group of steps
#[derive(Debug, Clone, Serialize)]
pub struct GroupStep {
    /// Group label
    pub group: String,

    /// Unique key for the group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Steps within the group
    pub steps: Vec<Step>,
}

/// Retry configuration
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryConfig {
    /// Automatic retry rules
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub automatic: Vec<AutomaticRetryRule>,

    /// Manual retry settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual: Option<ManualRetry>,
}

/// Automatic retry rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutomaticRetryRule {
    /// Exit status to retry on
    pub exit_status: ExitStatus,

    /// Number of retries
    pub limit: u32,
}

/// Exit status matched by a retry rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Any non-zero exit status (`"*"`)
    Any,
    /// A specific exit status; `-1` is reported when the agent is lost
    Code(i32),
}

impl Serialize for ExitStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Any => serializer.serialize_str("*"),
            Self::Code(code) => serializer.serialize_i32(*code),
        }
    }
}

/// Manual retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualRetry {
    /// Allow manual retry
    pub allowed: bool,

    /// Reason shown when retrying is not allowed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Step notification target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepNotify {
    /// Slack notification
    pub slack: SlackNotify,

    /// Only notify when this expression holds
    #[serde(rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Slack notification posted when the step finishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlackNotify {
    /// Channels to notify
    pub channels: Vec<String>,

    /// Message to post
    pub message: String,
}

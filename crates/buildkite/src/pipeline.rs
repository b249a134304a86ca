//! Pipeline builder
//!
//! Collects steps, applies the per-step defaults after each step's own options,
//! and validates the finished pipeline before it is written out.

use crate::cache::CacheSettings;
use crate::error::{Error, Result};
use crate::schema::{
    AutomaticRetryRule, CommandStep, ExitStatus, GroupStep, Pipeline, RetryConfig, Step,
    TriggerStep, WaitStep,
};
use crate::step::{StepOpt, TriggerOpt};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::debug;

/// Prefix that makes every command report its resource usage.
pub const PROFILING_PREFIX: &str = "env time -v ";

/// A default applied to every command step after its own options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDefault {
    /// Timeout in minutes for steps that run commands and set none
    Timeout(u32),
    /// Agent rule used when the step does not target that key itself
    Agent {
        /// Agent tag, usually `queue`
        key: String,
        /// Tag value
        value: String,
    },
    /// Retry once when the agent is lost, unless manual retries were disabled
    AgentLostRetry,
    /// Prefix commands with [`PROFILING_PREFIX`]
    Profiling,
}

impl StepDefault {
    /// Default agent queue.
    pub fn queue(value: impl Into<String>) -> Self {
        Self::Agent {
            key: "queue".to_string(),
            value: value.into(),
        }
    }

    fn apply(&self, step: &mut CommandStep) {
        match self {
            Self::Timeout(minutes) => {
                if step.timeout_in_minutes.is_none() && !step.command.is_empty() {
                    step.timeout_in_minutes = Some(*minutes);
                }
            }
            Self::Agent { key, value } => {
                if step.agents.get(key).is_none_or(String::is_empty) {
                    step.agents.insert(key.clone(), value.clone());
                }
            }
            Self::AgentLostRetry => {
                if step.manual_retry_disabled() {
                    return;
                }
                step.retry
                    .get_or_insert_with(RetryConfig::default)
                    .automatic
                    .push(AutomaticRetryRule {
                        exit_status: ExitStatus::Code(-1),
                        limit: 1,
                    });
            }
            Self::Profiling => {
                for command in &mut step.command {
                    command.insert_str(0, PROFILING_PREFIX);
                }
            }
        }
    }
}

/// Incrementally builds a [`Pipeline`]
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    env: BTreeMap<String, String>,
    steps: Vec<Step>,
    defaults: Vec<StepDefault>,
    cache: CacheSettings,
}

impl PipelineBuilder {
    /// Create a builder resolving cache requests with `cache`
    #[must_use]
    pub fn new(cache: CacheSettings) -> Self {
        Self {
            cache,
            ..Self::default()
        }
    }

    /// Set a pipeline-level environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Apply `default` to every command step added afterwards
    #[must_use]
    pub fn with_default(mut self, default: StepDefault) -> Self {
        self.defaults.push(default);
        self
    }

    /// Pipeline-level environment
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Steps added so far
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Add a command step
    pub fn add_step<I>(&mut self, label: impl Into<String>, opts: I)
    where
        I: IntoIterator<Item = StepOpt>,
    {
        let mut step = CommandStep {
            label: Some(label.into()),
            ..CommandStep::default()
        };
        for opt in opts {
            opt.apply(&mut step, &self.cache);
        }
        for default in &self.defaults {
            default.apply(&mut step);
        }
        debug!(label = ?step.label, key = ?step.key, "added command step");
        self.steps.push(Step::Command(Box::new(step)));
    }

    /// Add a trigger step starting a build of `pipeline`
    pub fn add_trigger<I>(&mut self, label: impl Into<String>, pipeline: impl Into<String>, opts: I)
    where
        I: IntoIterator<Item = TriggerOpt>,
    {
        let mut step = TriggerStep {
            trigger: pipeline.into(),
            label: Some(label.into()),
            ..TriggerStep::default()
        };
        for opt in opts {
            opt.apply(&mut step);
        }
        debug!(trigger = %step.trigger, "added trigger step");
        self.steps.push(Step::Trigger(step));
    }

    /// Add a wait step
    pub fn add_wait(&mut self) {
        self.steps.push(Step::Wait(WaitStep::default()));
    }

    /// Add a group whose steps are added by `build`
    ///
    /// The nested builder shares this builder's defaults and cache settings.
    /// A group that ends up empty is dropped.
    pub fn add_group(
        &mut self,
        label: impl Into<String>,
        key: impl Into<String>,
        build: impl FnOnce(&mut Self),
    ) {
        let mut nested = Self {
            env: BTreeMap::new(),
            steps: Vec::new(),
            defaults: self.defaults.clone(),
            cache: self.cache.clone(),
        };
        build(&mut nested);

        let label = label.into();
        if nested.steps.is_empty() {
            debug!(group = %label, "skipping empty group");
            return;
        }
        self.steps.push(Step::Group(GroupStep {
            group: label,
            key: Some(key.into()),
            steps: nested.steps,
        }));
    }

    /// Finish the pipeline, rejecting duplicate step keys
    pub fn build(self) -> Result<Pipeline> {
        let pipeline = Pipeline {
            env: self.env,
            steps: self.steps,
        };
        ensure_unique_keys(&pipeline)?;
        Ok(pipeline)
    }
}

/// Check that no two steps share a key, groups included
pub fn ensure_unique_keys(pipeline: &Pipeline) -> Result<()> {
    let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();
    for key in pipeline.walk().filter_map(Step::key) {
        *occurrences.entry(key).or_default() += 1;
    }

    match occurrences.into_iter().find(|(_, count)| *count > 1) {
        Some((key, count)) => Err(Error::DuplicateKey {
            key: key.to_string(),
            count,
        }),
        None => Ok(()),
    }
}

/// Serialize a pipeline as pretty-printed JSON
pub fn to_json(pipeline: &Pipeline) -> Result<String> {
    Ok(serde_json::to_string_pretty(pipeline)?)
}

/// Serialize a pipeline as YAML
pub fn to_yaml(pipeline: &Pipeline) -> Result<String> {
    Ok(serde_yaml::to_string(pipeline)?)
}

/// Write a pipeline as JSON
pub fn write_json(pipeline: &Pipeline, mut out: impl Write) -> Result<()> {
    serde_json::to_writer_pretty(&mut out, pipeline)?;
    writeln!(out)?;
    Ok(())
}

/// Write a pipeline as YAML
pub fn write_yaml(pipeline: &Pipeline, mut out: impl Write) -> Result<()> {
    out.write_all(to_yaml(pipeline)?.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepOpt;

    fn builder() -> PipelineBuilder {
        PipelineBuilder::new(CacheSettings::default())
            .with_default(StepDefault::Timeout(60))
            .with_default(StepDefault::queue("stateless"))
            .with_default(StepDefault::AgentLostRetry)
    }

    fn only_command(pipeline: &Pipeline) -> &CommandStep {
        pipeline.command_steps().next().unwrap()
    }

    #[test]
    fn test_defaults_applied_after_options() {
        let mut builder = builder();
        builder.add_step(":go: Build", [StepOpt::cmd("./dev/ci/go-build.sh")]);
        let pipeline = builder.build().unwrap();

        let step = only_command(&pipeline);
        assert_eq!(step.timeout_in_minutes, Some(60));
        assert_eq!(step.agents["queue"], "stateless");
        let retry = step.retry.as_ref().unwrap();
        assert_eq!(
            retry.automatic,
            vec![AutomaticRetryRule {
                exit_status: ExitStatus::Code(-1),
                limit: 1
            }]
        );
    }

    #[test]
    fn test_defaults_keep_explicit_values() {
        let mut builder = builder();
        builder.add_step(
            ":bazel: Build",
            [
                StepOpt::cmd("bazel build //..."),
                StepOpt::agent("queue", "bazel"),
                StepOpt::Timeout(30),
            ],
        );
        let pipeline = builder.build().unwrap();

        let step = only_command(&pipeline);
        assert_eq!(step.timeout_in_minutes, Some(30));
        assert_eq!(step.agents["queue"], "bazel");
    }

    #[test]
    fn test_timeout_needs_commands() {
        let mut builder = builder();
        builder.add_step("No commands", []);
        let pipeline = builder.build().unwrap();
        assert_eq!(only_command(&pipeline).timeout_in_minutes, None);
    }

    #[test]
    fn test_agent_lost_retry_respects_disabled_manual_retry() {
        let mut builder = builder();
        builder.add_step(
            "Percy chunk",
            [
                StepOpt::cmd("run.sh"),
                StepOpt::disable_manual_retry("restart the whole build"),
            ],
        );
        let pipeline = builder.build().unwrap();
        let retry = only_command(&pipeline).retry.as_ref().unwrap();
        assert!(retry.automatic.is_empty());
    }

    #[test]
    fn test_profiling_prefixes_commands() {
        let mut builder = builder().with_default(StepDefault::Profiling);
        builder.add_step("Profiled", [StepOpt::raw_cmd("make")]);
        let pipeline = builder.build().unwrap();
        assert_eq!(only_command(&pipeline).command, vec!["env time -v make"]);
    }

    #[test]
    fn test_group_shares_defaults_and_skips_empty() {
        let mut builder = builder();
        builder.add_group("Go checks", "go-checks", |group| {
            group.add_step(":go: Build", [StepOpt::cmd("./dev/ci/go-build.sh")]);
        });
        builder.add_group("Empty", "empty", |_| {});
        let pipeline = builder.build().unwrap();

        assert_eq!(pipeline.steps.len(), 1);
        let Step::Group(group) = &pipeline.steps[0] else {
            panic!("expected a group");
        };
        assert_eq!(group.key.as_deref(), Some("go-checks"));
        assert_eq!(only_command(&pipeline).timeout_in_minutes, Some(60));
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let mut builder = builder();
        builder.add_step("one", [StepOpt::key("same")]);
        builder.add_group("Group", "group", |group| {
            group.add_step("two", [StepOpt::key("same")]);
        });

        let err = builder.build().unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { ref key, count: 2 } if key == "same"));
    }

    #[test]
    fn test_trigger_and_wait() {
        let mut builder = builder();
        builder.add_trigger(
            ":snail: Trigger async",
            "sourcegraph-async",
            [TriggerOpt::Key("trigger:async".to_string()), TriggerOpt::Async(true)],
        );
        builder.add_wait();
        let pipeline = builder.build().unwrap();

        let json: serde_json::Value = serde_json::from_str(&to_json(&pipeline).unwrap()).unwrap();
        assert_eq!(json["steps"][0]["trigger"], "sourcegraph-async");
        assert_eq!(json["steps"][0]["async"], true);
        assert_eq!(json["steps"][1]["wait"], "~");
    }

    #[test]
    fn test_writers() {
        let mut builder = builder().with_env("CI", "true");
        builder.add_step("Echo", [StepOpt::raw_cmd("echo hi")]);
        let pipeline = builder.build().unwrap();

        let mut json = Vec::new();
        write_json(&pipeline, &mut json).unwrap();
        assert!(String::from_utf8(json).unwrap().ends_with("}\n"));

        let yaml = to_yaml(&pipeline).unwrap();
        assert!(yaml.contains("CI: 'true'") || yaml.contains("CI: \"true\""));
        assert!(yaml.contains("label: Echo"));
    }
}

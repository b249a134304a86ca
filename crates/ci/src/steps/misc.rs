//! Pipeline plumbing: waits, triggers, metadata and build traces

use crate::changed::Diff;
use crate::config::{Config, MessageFlags};
use crate::error::{Error, Result};
use crate::operations::Operation;
use crate::runtype::RunType;
use chrono::{DateTime, Utc};
use pipegen_buildkite::{
    AnnotatedCmdOpts, AnnotationOpts, AnnotationType, BuildOptions, PipelineBuilder, StepOpt,
    TriggerOpt,
};
use serde::Serialize;
use tracing::warn;

/// Waits for every previous step
#[derive(Debug, Clone, Copy, Default)]
pub struct Wait;

impl Operation for Wait {
    fn name(&self) -> String {
        "wait".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_wait();
    }
}

/// Uploads the trace of this build
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadBuildTrace;

impl Operation for UploadBuildTrace {
    fn name(&self) -> String {
        "upload build trace".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":arrow_heading_up: Upload build trace",
            [StepOpt::cmd(
                "./enterprise/dev/ci/scripts/upload-buildevent-report.sh",
            )],
        );
    }
}

/// Starts the async pipeline for the same commit without waiting for it
#[derive(Debug, Clone)]
pub struct TriggerAsync {
    pipeline: String,
    build: BuildOptions,
}

impl TriggerAsync {
    /// Trigger `pipeline` with the attributes of this build
    #[must_use]
    pub fn new(pipeline: impl Into<String>, build: BuildOptions) -> Self {
        Self {
            pipeline: pipeline.into(),
            build,
        }
    }
}

impl Operation for TriggerAsync {
    fn name(&self) -> String {
        format!("trigger {}", self.pipeline)
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_trigger(
            ":snail: Trigger async",
            &self.pipeline,
            [
                TriggerOpt::Key("trigger:async".to_string()),
                TriggerOpt::Async(true),
                TriggerOpt::Build(self.build.clone()),
            ],
        );
    }
}

/// Triggers healthcheck builds of the latest release branches
#[derive(Debug, Clone)]
pub struct ReleaseBranchHealthchecks {
    pipeline: String,
    branches: Vec<String>,
    message: String,
}

impl ReleaseBranchHealthchecks {
    /// Check the `major.minor` branch of `version` and the minor before it
    ///
    /// There is no previous minor to check for a `x.0` version.
    pub fn new(pipeline: impl Into<String>, version: &str, time: DateTime<Utc>) -> Result<Self> {
        let parsed = semver::Version::parse(version).map_err(|source| Error::InvalidVersion {
            version: version.to_string(),
            source,
        })?;

        let mut branches = vec![format!("{}.{}", parsed.major, parsed.minor)];
        if let Some(previous) = parsed.minor.checked_sub(1) {
            branches.push(format!("{}.{previous}", parsed.major));
        } else {
            warn!(version, "no previous minor release branch to check");
        }

        Ok(Self {
            pipeline: pipeline.into(),
            branches,
            message: format!(
                "{} healthcheck build",
                time.format("%a, %d %b %Y %H:%M:%S UTC")
            ),
        })
    }

    /// Branches a healthcheck is triggered for
    #[must_use]
    pub fn branches(&self) -> &[String] {
        &self.branches
    }
}

impl Operation for ReleaseBranchHealthchecks {
    fn name(&self) -> String {
        format!("healthchecks {}", self.branches.join(", "))
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        for branch in &self.branches {
            pipeline.add_trigger(
                format!(":stethoscope: Trigger {branch} release branch healthcheck build"),
                &self.pipeline,
                [
                    TriggerOpt::Async(false),
                    TriggerOpt::Build(BuildOptions {
                        message: self.message.clone(),
                        branch: branch.clone(),
                        ..BuildOptions::default()
                    }),
                ],
            );
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct BuildMetadata<'a> {
    run_type: RunType,
    version: &'a str,
    diff: Diff,
    message_flags: MessageFlags,
}

/// Exposes how this pipeline was computed as a build annotation
#[derive(Debug, Clone)]
pub struct PipelineMetadata {
    json: String,
}

impl PipelineMetadata {
    /// Serialize the run type, version, diff and message flags of `config`
    pub fn new(config: &Config) -> Result<Self> {
        let json = serde_json::to_string(&BuildMetadata {
            run_type: config.run_type,
            version: &config.version,
            diff: config.diff,
            message_flags: config.message_flags,
        })?;
        Ok(Self { json })
    }

    /// The `BUILD_METADATA` document
    #[must_use]
    pub fn json(&self) -> &str {
        &self.json
    }
}

impl Operation for PipelineMetadata {
    fn name(&self) -> String {
        "pipeline metadata".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":memo::pipeline: Pipeline metadata",
            [
                StepOpt::SoftFail(vec![]),
                StepOpt::env("BUILD_METADATA", &self.json),
                StepOpt::annotated_cmd(
                    "dev/ci/gen-metadata-annotation.sh",
                    AnnotatedCmdOpts {
                        annotations: Some(AnnotationOpts {
                            kind: AnnotationType::Info,
                            include_names: false,
                            multi_job_context: None,
                        }),
                        test_reports: None,
                    },
                ),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::StaticGit;
    use crate::steps::testing::{command_steps, pipeline};
    use chrono::TimeZone;
    use pipegen_buildkite::Step;
    use std::collections::HashMap;
    use std::path::Path;

    fn time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 5, 6, 7, 8).unwrap()
    }

    #[test]
    fn test_trigger_async() {
        let op = TriggerAsync::new(
            "sourcegraph-async",
            BuildOptions {
                commit: "abc".to_string(),
                ..BuildOptions::default()
            },
        );
        let built = pipeline(&op);
        let Step::Trigger(trigger) = &built.steps[0] else {
            panic!("expected a trigger step");
        };
        assert_eq!(trigger.trigger, "sourcegraph-async");
        assert_eq!(trigger.key.as_deref(), Some("trigger:async"));
        assert_eq!(trigger.is_async, Some(true));
        assert_eq!(trigger.build.as_ref().unwrap().commit, "abc");
    }

    #[test]
    fn test_healthchecks_current_and_previous_minor() {
        let op = ReleaseBranchHealthchecks::new("sourcegraph", "5.2.0", time()).unwrap();
        assert_eq!(op.branches(), ["5.2", "5.1"]);

        let built = pipeline(&op);
        let Step::Trigger(trigger) = &built.steps[1] else {
            panic!("expected a trigger step");
        };
        assert_eq!(
            trigger.label.as_deref(),
            Some(":stethoscope: Trigger 5.1 release branch healthcheck build")
        );
        let build = trigger.build.as_ref().unwrap();
        assert_eq!(build.branch, "5.1");
        assert_eq!(build.message, "Wed, 05 Apr 2023 06:07:08 UTC healthcheck build");
        assert_eq!(trigger.is_async, Some(false));
    }

    #[test]
    fn test_healthchecks_first_minor() {
        let op = ReleaseBranchHealthchecks::new("sourcegraph", "5.0.0", time()).unwrap();
        assert_eq!(op.branches(), ["5.0"]);
    }

    #[test]
    fn test_healthchecks_invalid_version() {
        assert!(matches!(
            ReleaseBranchHealthchecks::new("sourcegraph", "5.x", time()),
            Err(Error::InvalidVersion { .. })
        ));
    }

    #[test]
    fn test_metadata_document() {
        let env: HashMap<String, String> = [
            ("BUILDKITE_BRANCH", "main"),
            ("BUILDKITE_COMMIT", "abc"),
            ("BUILDKITE_MESSAGE", "fix [skip-hash-compare]"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let git = StaticGit::new(["main.go"]);
        let config = Config::compute(&env, &git, time(), Path::new("/nonexistent")).unwrap();

        let op = PipelineMetadata::new(&config).unwrap();
        let doc: serde_json::Value = serde_json::from_str(op.json()).unwrap();
        assert_eq!(doc["RunType"], "Main branch");
        assert_eq!(doc["Diff"], "Go");
        assert_eq!(doc["Version"], config.version.as_str());
        assert_eq!(doc["MessageFlags"]["SkipHashCompare"], true);

        let step = &command_steps(&op)[0];
        assert_eq!(step.env["BUILD_METADATA"], op.json());
        assert_eq!(step.env["ANNOTATE_OPTS"], "false -t info");
    }
}

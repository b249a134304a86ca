//! Go builds and tests

use crate::operations::Operation;
use pipegen_buildkite::{AnnotatedCmdOpts, PipelineBuilder, StepOpt};

const MODULE_PREFIX: &str = "github.com/sourcegraph/sourcegraph/";

/// Packages slow enough to get a test job of their own
pub const SLOW_GO_TEST_PACKAGES: &[&str] = &[
    "github.com/sourcegraph/sourcegraph/internal/codeintel/stores/dbstore",
    "github.com/sourcegraph/sourcegraph/internal/codeintel/stores/lsifstore",
    "github.com/sourcegraph/sourcegraph/enterprise/internal/insights",
    "github.com/sourcegraph/sourcegraph/internal/database",
    "github.com/sourcegraph/sourcegraph/internal/repos",
    "github.com/sourcegraph/sourcegraph/enterprise/internal/batches",
    "github.com/sourcegraph/sourcegraph/cmd/frontend",
    "github.com/sourcegraph/sourcegraph/enterprise/internal/database",
    "github.com/sourcegraph/sourcegraph/enterprise/cmd/frontend/internal/batches/resolvers",
];

/// `(description, go-test.sh arguments)` for each test job: everything but
/// the slow packages, then one job per slow package
fn go_test_jobs() -> Vec<(String, String)> {
    let mut jobs = vec![(
        "all".to_string(),
        format!("exclude {}", SLOW_GO_TEST_PACKAGES.join(" ")),
    )];
    jobs.extend(SLOW_GO_TEST_PACKAGES.iter().map(|pkg| {
        (
            pkg.trim_start_matches(MODULE_PREFIX).to_string(),
            format!("only {pkg}"),
        )
    }));
    jobs
}

/// Go unit tests, split across jobs
#[derive(Debug, Clone, Copy, Default)]
pub struct GoTests;

impl Operation for GoTests {
    fn name(&self) -> String {
        "Go tests".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        for (description, args) in go_test_jobs() {
            pipeline.add_step(
                format!(":go: Test ({description})"),
                [
                    // GOMAXPROCS * TESTDB_MAXOPENCONNS must stay below the
                    // 200 connections the agent database allows
                    StepOpt::env("GOMAXPROCS", "10"),
                    StepOpt::env("TESTDB_MAXOPENCONNS", "15"),
                    StepOpt::annotated_cmd(
                        format!("./dev/ci/go-test.sh {args}"),
                        AnnotatedCmdOpts::annotations(),
                    ),
                    StepOpt::cmd("./dev/ci/codecov.sh -c -F go"),
                ],
            );
        }
    }
}

/// Tests of the previous minor release against the current schema
#[derive(Debug, Clone)]
pub struct GoBackcompatTests {
    /// Oldest version instances upgrade from
    pub minimum_upgradeable_version: String,
}

impl Operation for GoBackcompatTests {
    fn name(&self) -> String {
        format!("Go backcompat tests ({})", self.minimum_upgradeable_version)
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        for (description, args) in go_test_jobs() {
            pipeline.add_step(
                format!(":go::postgres: Backcompat test ({description})"),
                [
                    StepOpt::env(
                        "MINIMUM_UPGRADEABLE_VERSION",
                        &self.minimum_upgradeable_version,
                    ),
                    StepOpt::annotated_cmd(
                        format!("./dev/ci/go-backcompat/test.sh {args}"),
                        AnnotatedCmdOpts::annotations(),
                    ),
                ],
            );
        }
    }
}

/// Builds the Go commands
#[derive(Debug, Clone, Copy, Default)]
pub struct GoBuild;

impl Operation for GoBuild {
    fn name(&self) -> String {
        "Go build".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(":go: Build", [StepOpt::cmd("./dev/ci/go-build.sh")]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::command_steps;

    #[test]
    fn test_go_tests_split_slow_packages() {
        let steps = command_steps(&GoTests);
        assert_eq!(steps.len(), SLOW_GO_TEST_PACKAGES.len() + 1);
        assert_eq!(steps[0].label.as_deref(), Some(":go: Test (all)"));
        assert!(steps[0].command[0].contains("go-test.sh exclude github.com/"));
        assert_eq!(
            steps[1].label.as_deref(),
            Some(":go: Test (internal/codeintel/stores/dbstore)")
        );
        assert!(steps[1].command[0].ends_with(
            "go-test.sh only github.com/sourcegraph/sourcegraph/internal/codeintel/stores/dbstore"
        ));
        assert_eq!(steps[1].env["GOMAXPROCS"], "10");
    }

    #[test]
    fn test_backcompat_passes_version() {
        let steps = command_steps(&GoBackcompatTests {
            minimum_upgradeable_version: "5.0.0".to_string(),
        });
        assert!(steps
            .iter()
            .all(|s| s.env["MINIMUM_UPGRADEABLE_VERSION"] == "5.0.0"));
    }
}

//! Linters, static analysis and CI script tests

use super::pnpm_cache;
use crate::error::{Error, Result};
use crate::operations::Operation;
use pipegen_buildkite::{AnnotatedCmdOpts, AnnotationOpts, PipelineBuilder, StepOpt};
use std::path::Path;
use tracing::debug;

/// Directory holding the CI script tests, relative to the repository root
pub const CI_SCRIPT_TESTS_DIR: &str = "enterprise/dev/ci/scripts/tests";

/// Lints the GraphQL schema
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphQlLint;

impl Operation for GraphQlLint {
    fn name(&self) -> String {
        "GraphQL lint".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":lipstick: :graphql: GraphQL lint",
            [pnpm_cache(), StepOpt::cmd("dev/ci/pnpm-run.sh lint:graphql")],
        );
    }
}

/// Runs `sg lint` for the given targets
#[derive(Debug, Clone)]
pub struct SgLint {
    targets: Vec<&'static str>,
    verbose: bool,
}

impl SgLint {
    /// Lint `targets`; retried jobs lint verbosely
    #[must_use]
    pub fn new(targets: Vec<&'static str>, retry_count: u32) -> Self {
        Self {
            targets,
            verbose: retry_count > 0,
        }
    }

    fn command(&self) -> String {
        let mut cmd = "go run ./dev/sg ".to_string();
        if self.verbose {
            cmd.push_str("-v ");
        }
        cmd.push_str("lint -annotations -fail-fast=false ");
        cmd.push_str(&self.targets.join(" "));
        cmd
    }
}

impl Operation for SgLint {
    fn name(&self) -> String {
        format!("sg lint {}", self.targets.join(" "))
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":pineapple::lint-roller: Run sg lint",
            [
                pnpm_cache(),
                StepOpt::annotated_cmd(
                    self.command(),
                    AnnotatedCmdOpts {
                        annotations: Some(AnnotationOpts {
                            include_names: true,
                            ..AnnotationOpts::default()
                        }),
                        test_reports: None,
                    },
                ),
            ],
        );
    }
}

/// ESLint and Stylelint over all files, or only the changed ones
#[derive(Debug, Clone, Copy)]
pub struct ClientLinters {
    /// Lint only files changed by the pull request
    pub changed_only: bool,
}

impl Operation for ClientLinters {
    fn name(&self) -> String {
        if self.changed_only {
            "client linters (changed)".to_string()
        } else {
            "client linters (all)".to_string()
        }
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        let scope = if self.changed_only { "changed" } else { "all" };
        pipeline.add_step(
            format!(":eslint: ESLint ({scope})"),
            [
                pnpm_cache(),
                StepOpt::cmd(format!("dev/ci/pnpm-run.sh lint:js:{scope}")),
            ],
        );
        pipeline.add_step(
            format!(":stylelint: Stylelint ({scope})"),
            [
                pnpm_cache(),
                StepOpt::cmd(format!("dev/ci/pnpm-run.sh lint:css:{scope}")),
            ],
        );
    }
}

/// One step per test script of the CI scripts
#[derive(Debug, Clone)]
pub struct CiScriptTests {
    scripts: Vec<String>,
}

impl CiScriptTests {
    /// Find the `.sh` test scripts under [`CI_SCRIPT_TESTS_DIR`]
    pub fn discover(repo_root: &Path) -> Result<Self> {
        let dir = repo_root.join(CI_SCRIPT_TESTS_DIR);
        let entries = std::fs::read_dir(&dir).map_err(|err| Error::io(&dir, err))?;

        let mut scripts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| Error::io(&dir, err))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "sh")
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
            {
                scripts.push(name.to_string());
            }
        }
        scripts.sort();
        debug!(count = scripts.len(), "discovered CI script tests");
        Ok(Self { scripts })
    }

    /// Test script names
    #[must_use]
    pub fn scripts(&self) -> &[String] {
        &self.scripts
    }
}

impl Operation for CiScriptTests {
    fn name(&self) -> String {
        "CI script tests".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        for script in &self.scripts {
            pipeline.add_step(
                format!(":bash: {script}"),
                [StepOpt::raw_cmd(format!("./{CI_SCRIPT_TESTS_DIR}/{script}"))],
            );
        }
    }
}

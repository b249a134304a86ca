//! Client builds, tests and releases

use super::{FRONTEND_UNIT_TEST_SUITE, PNPM_INSTALL, pnpm_cache};
use crate::operations::Operation;
use chrono::{DateTime, Utc};
use pipegen_buildkite::{AnnotatedCmdOpts, AnnotationOpts, PipelineBuilder, StepOpt};
use std::path::Path;
use tracing::{debug, warn};

/// Browsers the extension is tested in
pub const BROWSERS: &[&str] = &["chrome"];

/// Web integration test files per Puppeteer chunk
pub const INTEGRATION_CHUNK_SIZE: usize = 2;

const INTEGRATION_TEST_GLOB: &str = "client/web/src/integration/**/*.test.ts";
const PUPPETEER_PREP_KEY: &str = "puppeteer:prep";
const PUPPETEER_SCREENSHOTS: &str = "./puppeteer/*.png";

fn parallel_test_count(web_chunks: usize) -> usize {
    web_chunks + BROWSERS.len()
}

fn unit_test_reports() -> AnnotatedCmdOpts {
    AnnotatedCmdOpts::test_reports(FRONTEND_UNIT_TEST_SUITE)
}

/// Type checks the client
#[derive(Debug, Clone, Copy, Default)]
pub struct TypescriptCheck;

impl Operation for TypescriptCheck {
    fn name(&self) -> String {
        "TypeScript check".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":typescript: Build TS",
            [pnpm_cache(), StepOpt::cmd("dev/ci/pnpm-run.sh build-ts")],
        );
    }
}

/// OSS and enterprise web app builds plus the web app unit tests
#[derive(Debug, Clone, Copy, Default)]
pub struct WebApp;

impl Operation for WebApp {
    fn name(&self) -> String {
        "web app".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":webpack::globe_with_meridians: Build",
            [
                pnpm_cache(),
                StepOpt::cmd("dev/ci/pnpm-build.sh client/web"),
                StepOpt::env("NODE_ENV", "production"),
                StepOpt::env("ENTERPRISE", ""),
            ],
        );

        pipeline.add_step(
            ":webpack::globe_with_meridians::moneybag: Enterprise build",
            [
                pnpm_cache(),
                StepOpt::cmd("dev/ci/pnpm-build.sh client/web"),
                StepOpt::env("NODE_ENV", "production"),
                StepOpt::env("ENTERPRISE", "1"),
                StepOpt::env("CHECK_BUNDLESIZE", "1"),
                // keeps bundle size output comparable with main
                StepOpt::env("WEBPACK_USE_NAMED_CHUNKS", "true"),
            ],
        );

        pipeline.add_step(
            ":jest::globe_with_meridians: Test (client/web)",
            [
                pnpm_cache(),
                StepOpt::annotated_cmd("dev/ci/pnpm-test.sh client/web", unit_test_reports()),
                StepOpt::cmd("dev/ci/codecov.sh -c -F typescript -F unit"),
            ],
        );
    }
}

/// Unit tests outside the web app and the browser extension
#[derive(Debug, Clone, Copy, Default)]
pub struct FrontendTests;

impl Operation for FrontendTests {
    fn name(&self) -> String {
        "frontend tests".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":jest: Test (all)",
            [
                pnpm_cache(),
                StepOpt::annotated_cmd(
                    "dev/ci/pnpm-test.sh --testPathIgnorePatterns client/web client/browser",
                    unit_test_reports(),
                ),
                StepOpt::cmd("dev/ci/codecov.sh -c -F typescript -F unit"),
            ],
        );
    }
}

/// Browser extension unit tests
#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserExtensionUnitTests;

impl Operation for BrowserExtensionUnitTests {
    fn name(&self) -> String {
        "browser extension unit tests".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":jest::chrome: Test (client/browser)",
            [
                pnpm_cache(),
                StepOpt::annotated_cmd("dev/ci/pnpm-test.sh client/browser", unit_test_reports()),
                StepOpt::cmd("dev/ci/codecov.sh -c -F typescript -F unit"),
            ],
        );
    }
}

/// JetBrains plugin build
#[derive(Debug, Clone, Copy, Default)]
pub struct JetBrainsUnitTests;

impl Operation for JetBrainsUnitTests {
    fn name(&self) -> String {
        "JetBrains unit tests".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":jest::java: Test (client/jetbrains)",
            [
                pnpm_cache(),
                StepOpt::cmd(PNPM_INSTALL),
                StepOpt::cmd("pnpm generate"),
                StepOpt::cmd("pnpm --filter @sourcegraph/jetbrains run build"),
            ],
        );
    }
}

/// Uploads the storybook to Chromatic
#[derive(Debug, Clone, Copy, Default)]
pub struct ChromaticTests {
    /// Accept visual changes automatically
    pub auto_accept: bool,
    /// Run on draft pull requests too
    pub force_ready_for_review: bool,
}

impl Operation for ChromaticTests {
    fn name(&self) -> String {
        "Chromatic".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        let mut opts = vec![
            pnpm_cache(),
            StepOpt::AutomaticRetry(3),
            StepOpt::cmd("./dev/ci/pnpm-install-with-retry.sh"),
            StepOpt::cmd("pnpm gulp generate"),
            StepOpt::env("MINIFY", "1"),
        ];

        let mut command = "pnpm chromatic --exit-zero-on-changes --exit-once-uploaded --build-script-name=storybook:build".to_string();
        if self.auto_accept {
            command.push_str(" --auto-accept-changes");
        } else {
            // Changes need a review, which only happens on ready pull requests.
            opts.push(StepOpt::IfReadyForReview(self.force_ready_for_review));
            command.push_str(" | ./dev/ci/post-chromatic.sh");
        }
        opts.push(StepOpt::cmd(command));

        pipeline.add_step(":chromatic: Upload Storybook to Chromatic", opts);
    }
}

/// Puppeteer tests for the browser extension
#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserExtensionIntegrationTests {
    /// Web integration chunks contributing to the same Percy build
    pub web_chunks: usize,
}

impl Operation for BrowserExtensionIntegrationTests {
    fn name(&self) -> String {
        "browser extension integration tests".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        let total = parallel_test_count(self.web_chunks);
        for browser in BROWSERS {
            pipeline.add_step(
                format!(":{browser}: Puppeteer tests for {browser} extension"),
                [
                    pnpm_cache(),
                    StepOpt::env("EXTENSION_PERMISSIONS_ALL_URLS", "true"),
                    StepOpt::env("BROWSER", *browser),
                    StepOpt::env("LOG_BROWSER_CONSOLE", "false"),
                    StepOpt::env("SOURCEGRAPH_BASE_URL", "https://sourcegraph.com"),
                    StepOpt::env("POLLYJS_MODE", "replay"),
                    StepOpt::env("PERCY_ON", "true"),
                    StepOpt::env("PERCY_PARALLEL_TOTAL", total.to_string()),
                    StepOpt::cmd(PNPM_INSTALL),
                    StepOpt::cmd("pnpm --filter @sourcegraph/browser run build"),
                    StepOpt::cmd("pnpm run cover-browser-integration"),
                    StepOpt::cmd("pnpm nyc report -r json"),
                    StepOpt::cmd("dev/ci/codecov.sh -c -F typescript -F integration"),
                    StepOpt::artifact_paths([PUPPETEER_SCREENSHOTS]),
                ],
            );
        }
    }
}

/// Web integration tests, chunked across agents, plus the extension's
/// integration tests sharing their Percy build
#[derive(Debug, Clone, Default)]
pub struct ClientIntegrationTests {
    chunks: Vec<String>,
}

impl ClientIntegrationTests {
    /// Chunk the given test files
    #[must_use]
    pub fn new(files: &[String]) -> Self {
        Self {
            chunks: files
                .chunks(INTEGRATION_CHUNK_SIZE)
                .map(|chunk| chunk.join(" "))
                .collect(),
        }
    }

    /// Find the web integration test files under `repo_root`
    #[must_use]
    pub fn discover(repo_root: &Path) -> Self {
        let pattern = repo_root.join(INTEGRATION_TEST_GLOB);
        let mut files = Vec::new();
        match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => {
                for path in paths.flatten() {
                    let relative = path.strip_prefix(repo_root).unwrap_or(&path);
                    files.push(relative.to_string_lossy().into_owned());
                }
            }
            Err(err) => warn!(%err, "invalid integration test pattern"),
        }
        files.sort();
        debug!(files = files.len(), "discovered web integration tests");
        Self::new(&files)
    }

    /// Space separated test files, one entry per chunk
    #[must_use]
    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }
}

impl Operation for ClientIntegrationTests {
    fn name(&self) -> String {
        format!("client integration tests ({} chunks)", self.chunks.len())
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        // Built once, shared by the parallel chunks.
        pipeline.add_step(
            ":puppeteer::electric_plug: Puppeteer tests prep",
            [
                pnpm_cache(),
                StepOpt::key(PUPPETEER_PREP_KEY),
                StepOpt::env("ENTERPRISE", "1"),
                StepOpt::env("INTEGRATION_TESTS", "true"),
                StepOpt::env("COVERAGE_INSTRUMENT", "true"),
                StepOpt::cmd("dev/ci/pnpm-build.sh client/web"),
                StepOpt::cmd("dev/ci/create-client-artifact.sh"),
            ],
        );

        BrowserExtensionIntegrationTests {
            web_chunks: self.chunks.len(),
        }
        .apply(pipeline);

        let total = parallel_test_count(self.chunks.len());
        for (i, chunk) in self.chunks.iter().enumerate() {
            pipeline.add_step(
                format!(":puppeteer::electric_plug: Puppeteer tests chunk #{}", i + 1),
                [
                    pnpm_cache(),
                    StepOpt::depends_on(PUPPETEER_PREP_KEY),
                    StepOpt::disable_manual_retry(
                        "The Percy build is not finalized if one of the concurrent agents fails. To retry correctly, restart the entire pipeline.",
                    ),
                    StepOpt::env("PERCY_ON", "true"),
                    // Percy waits for this many builds before finalizing
                    StepOpt::env("PERCY_PARALLEL_TOTAL", total.to_string()),
                    StepOpt::annotated_cmd(
                        format!("dev/ci/pnpm-web-integration.sh \"{chunk}\""),
                        AnnotatedCmdOpts {
                            annotations: Some(AnnotationOpts {
                                include_names: true,
                                multi_job_context: Some("puppeteer".to_string()),
                                ..AnnotationOpts::default()
                            }),
                            test_reports: None,
                        },
                    ),
                    StepOpt::artifact_paths([PUPPETEER_SCREENSHOTS]),
                ],
            );
        }
    }
}

/// End-to-end tests of the extension against live code hosts
#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserExtensionE2e;

impl Operation for BrowserExtensionE2e {
    fn name(&self) -> String {
        "browser extension e2e".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        for browser in BROWSERS {
            pipeline.add_step(
                format!(":{browser}: E2E for {browser} extension"),
                [
                    pnpm_cache(),
                    StepOpt::env("EXTENSION_PERMISSIONS_ALL_URLS", "true"),
                    StepOpt::env("BROWSER", *browser),
                    StepOpt::env("LOG_BROWSER_CONSOLE", "true"),
                    StepOpt::env("SOURCEGRAPH_BASE_URL", "https://sourcegraph.com"),
                    StepOpt::cmd(PNPM_INSTALL),
                    StepOpt::cmd("pnpm --filter @sourcegraph/browser run build"),
                    StepOpt::cmd(
                        "pnpm mocha ./client/browser/src/end-to-end/github.test.ts ./client/browser/src/end-to-end/gitlab.test.ts",
                    ),
                    StepOpt::artifact_paths([PUPPETEER_SCREENSHOTS]),
                ],
            );
        }
    }
}

/// Extension e2e tests, then releases to the browser stores and npm
#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserExtensionRelease;

impl Operation for BrowserExtensionRelease {
    fn name(&self) -> String {
        "browser extension release".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        BrowserExtensionE2e.apply(pipeline);
        pipeline.add_wait();

        pipeline.add_step(
            ":rocket::chrome: Extension release",
            [
                pnpm_cache(),
                StepOpt::cmd(PNPM_INSTALL),
                StepOpt::cmd("pnpm --filter @sourcegraph/browser run build"),
                StepOpt::cmd("pnpm --filter @sourcegraph/browser release:chrome"),
            ],
        );
        pipeline.add_step(
            ":rocket::firefox: Extension release",
            [
                pnpm_cache(),
                StepOpt::cmd(PNPM_INSTALL),
                StepOpt::cmd("pnpm --filter @sourcegraph/browser release:firefox"),
            ],
        );
        pipeline.add_step(
            ":rocket::npm: npm Release",
            [
                pnpm_cache(),
                StepOpt::cmd(PNPM_INSTALL),
                StepOpt::cmd("pnpm --filter @sourcegraph/browser run build"),
                StepOpt::cmd("pnpm --filter @sourcegraph/browser release:npm"),
            ],
        );
    }
}

/// VS Code extension integration tests
#[derive(Debug, Clone, Copy, Default)]
pub struct VsceIntegrationTests;

impl Operation for VsceIntegrationTests {
    fn name(&self) -> String {
        "VS Code extension tests".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":vscode: Puppeteer tests for VS Code extension",
            [
                pnpm_cache(),
                StepOpt::cmd(PNPM_INSTALL),
                StepOpt::cmd("pnpm generate"),
                StepOpt::cmd("pnpm --filter @sourcegraph/vscode run build:test"),
                StepOpt::cmd("pnpm --filter @sourcegraph/vscode run test-integration --verbose"),
                StepOpt::AutomaticRetry(1),
            ],
        );
    }
}

/// Publishes the VS Code extension to the marketplace
#[derive(Debug, Clone, Copy, Default)]
pub struct VsceRelease;

impl Operation for VsceRelease {
    fn name(&self) -> String {
        "VS Code extension release".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":vscode: Extension release",
            [
                pnpm_cache(),
                StepOpt::cmd(PNPM_INSTALL),
                StepOpt::cmd("pnpm generate"),
                StepOpt::cmd("pnpm --filter @sourcegraph/vscode run release"),
            ],
        );
    }
}

/// Releases the desktop app
#[derive(Debug, Clone)]
pub struct AppRelease {
    version: String,
}

impl AppRelease {
    /// `yyyy.mm.dd+<build>.<commit>`, with `-insiders` after the date for
    /// insiders releases
    #[must_use]
    pub fn new(time: DateTime<Utc>, build_number: u64, commit: &str, insiders: bool) -> Self {
        let short: String = commit.chars().take(6).collect();
        let channel = if insiders { "-insiders" } else { "" };
        Self {
            version: format!("{}{channel}+{build_number}.{short}", time.format("%Y.%m.%d")),
        }
    }

    /// Version of the release
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl Operation for AppRelease {
    fn name(&self) -> String {
        format!("app release {}", self.version)
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":desktop_computer: App release",
            [
                pnpm_cache(),
                StepOpt::cmd(PNPM_INSTALL),
                StepOpt::env("VERSION", &self.version),
                StepOpt::cmd("enterprise/dev/ci/scripts/release-app.sh"),
            ],
        );
    }
}

/// Asks render.com for a preview deployment of the pull request
#[derive(Debug, Clone, Copy, Default)]
pub struct PrPreview;

impl Operation for PrPreview {
    fn name(&self) -> String {
        "client PR preview".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":globe_with_meridians: Client PR preview",
            [
                StepOpt::SoftFail(Vec::new()),
                StepOpt::cmd("dev/ci/render-pr-preview.sh"),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::command_steps;
    use chrono::TimeZone;
    use pipegen_buildkite::step::READY_FOR_REVIEW_CONDITION;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_chromatic_waits_for_review() {
        let steps = command_steps(&ChromaticTests::default());
        assert_eq!(steps[0].condition.as_deref(), Some(READY_FOR_REVIEW_CONDITION));
        assert!(steps[0].command.last().unwrap().ends_with("post-chromatic.sh"));

        let forced = command_steps(&ChromaticTests {
            auto_accept: false,
            force_ready_for_review: true,
        });
        assert_eq!(forced[0].condition, None);

        let auto = command_steps(&ChromaticTests {
            auto_accept: true,
            force_ready_for_review: false,
        });
        assert_eq!(auto[0].condition, None);
        assert!(auto[0].command.last().unwrap().ends_with("--auto-accept-changes"));
    }

    #[test]
    fn test_integration_chunks() {
        let files: Vec<String> = (1..=5).map(|i| format!("t{i}.test.ts")).collect();
        let op = ClientIntegrationTests::new(&files);
        assert_eq!(
            op.chunks(),
            ["t1.test.ts t2.test.ts", "t3.test.ts t4.test.ts", "t5.test.ts"]
        );

        let steps = command_steps(&op);
        // prep, one browser, three chunks
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[1].env["PERCY_PARALLEL_TOTAL"], "4");

        let chunk = &steps[2];
        assert_eq!(chunk.depends_on, vec![PUPPETEER_PREP_KEY]);
        assert!(chunk.manual_retry_disabled());
        assert_eq!(chunk.env["ANNOTATE_OPTS"], "true -t error -c puppeteer");
    }

    #[test]
    fn test_discover_integration_tests() {
        let dir = TempDir::new().unwrap();
        let integration = dir.path().join("client/web/src/integration");
        fs::create_dir_all(integration.join("nested")).unwrap();
        fs::write(integration.join("search.test.ts"), "").unwrap();
        fs::write(integration.join("nested/repo.test.ts"), "").unwrap();
        fs::write(integration.join("helpers.ts"), "").unwrap();

        let op = ClientIntegrationTests::discover(dir.path());
        assert_eq!(
            op.chunks(),
            ["client/web/src/integration/nested/repo.test.ts client/web/src/integration/search.test.ts"]
        );
    }

    #[test]
    fn test_browser_extension_release_waits() {
        let pipeline = crate::steps::testing::pipeline(&BrowserExtensionRelease);
        assert!(matches!(
            pipeline.steps[1],
            pipegen_buildkite::Step::Wait(_)
        ));
        assert_eq!(pipeline.command_steps().count(), 4);
    }

    #[test]
    fn test_app_release_version() {
        let time = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let commit = "abcdef0123456789";
        assert_eq!(
            AppRelease::new(time, 12, commit, false).version(),
            "2023.06.01+12.abcdef"
        );
        assert_eq!(
            AppRelease::new(time, 12, commit, true).version(),
            "2023.06.01-insiders+12.abcdef"
        );
    }

    #[test]
    fn test_pr_preview_soft_fails() {
        let steps = command_steps(&PrPreview);
        assert_eq!(
            steps[0].soft_fail,
            Some(pipegen_buildkite::schema::SoftFail::Any(true))
        );
    }
}

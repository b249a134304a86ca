//! Tests run against candidate images

use crate::images::{DEPLOY_SOURCEGRAPH_DOCKER_IMAGES, candidate_image_step_key, dev_image};
use crate::operations::Operation;
use crate::settings::Registries;
use pipegen_buildkite::{AnnotatedCmdOpts, PipelineBuilder, SlackStepNotify, StepOpt};

const BASE_URL: &str = "http://127.0.0.1:7080";
const VIDEO_ARTIFACTS: [&str; 3] = ["./*.png", "./*.mp4", "./*.log"];

/// Env shared by every test that drives a running instance
fn instance_env(candidate_tag: &str) -> Vec<StepOpt> {
    vec![
        StepOpt::env("CANDIDATE_VERSION", candidate_tag),
        StepOpt::env("SOURCEGRAPH_BASE_URL", BASE_URL),
        StepOpt::env("SOURCEGRAPH_SUDO_USER", "admin"),
        StepOpt::env("TEST_USER_EMAIL", "test@sourcegraph.com"),
        StepOpt::env("TEST_USER_PASSWORD", "supersecurepassword"),
    ]
}

/// Backend integration tests against the server candidate
#[derive(Debug, Clone)]
pub struct BackendIntegrationTests {
    image: String,
}

impl BackendIntegrationTests {
    /// Test the server image tagged `candidate_tag`
    #[must_use]
    pub fn new(candidate_tag: &str, registries: &Registries) -> Self {
        Self {
            image: dev_image(registries, "server", candidate_tag),
        }
    }
}

impl Operation for BackendIntegrationTests {
    fn name(&self) -> String {
        "backend integration tests".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":chains: Backend integration tests",
            [
                StepOpt::depends_on(candidate_image_step_key("server")),
                StepOpt::env("IMAGE", &self.image),
                StepOpt::cmd("dev/ci/integration/backend/run.sh"),
                StepOpt::artifact_paths(["./*.log"]),
            ],
        );
    }
}

/// Code intelligence QA; flaky, so it only notifies its owners
#[derive(Debug, Clone)]
pub struct CodeIntelQa {
    /// Candidate image tag under test
    pub candidate_tag: String,
}

impl Operation for CodeIntelQa {
    fn name(&self) -> String {
        "code intel QA".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        let mut opts = vec![
            StepOpt::SlackStepNotify(SlackStepNotify {
                message: ":alert: Code Intel QA flake detected".to_string(),
                channel_name: "code-intel-buildkite".to_string(),
                only_on_failure: true,
            }),
            StepOpt::depends_on(candidate_image_step_key("server")),
        ];
        opts.extend(instance_env(&self.candidate_tag));
        opts.extend([
            StepOpt::cmd("dev/ci/integration/code-intel/run.sh"),
            StepOpt::artifact_paths(["./*.log"]),
            StepOpt::SoftFail(vec![1]),
        ]);
        pipeline.add_step(":docker::brain: Code Intel QA", opts);
    }
}

/// Browser end-to-end tests against the server candidate
#[derive(Debug, Clone)]
pub struct ServerE2e {
    /// Candidate image tag under test
    pub candidate_tag: String,
}

impl Operation for ServerE2e {
    fn name(&self) -> String {
        "server e2e".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        let mut opts = vec![
            StepOpt::depends_on(candidate_image_step_key("server")),
            StepOpt::env("DISPLAY", ":99"),
            StepOpt::env("INCLUDE_ADMIN_ONBOARDING", "false"),
        ];
        opts.extend(instance_env(&self.candidate_tag));
        opts.extend([
            StepOpt::annotated_cmd("dev/ci/integration/e2e/run.sh", AnnotatedCmdOpts::annotations()),
            StepOpt::artifact_paths(VIDEO_ARTIFACTS),
        ]);
        pipeline.add_step(":chromium: Sourcegraph E2E", opts);
    }
}

/// QA suite against the server candidate
#[derive(Debug, Clone)]
pub struct ServerQa {
    /// Candidate image tag under test
    pub candidate_tag: String,
}

impl Operation for ServerQa {
    fn name(&self) -> String {
        "server QA".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        let mut opts = vec![
            StepOpt::depends_on(candidate_image_step_key("server")),
            StepOpt::env("DISPLAY", ":99"),
            StepOpt::env("LOG_STATUS_MESSAGES", "true"),
            StepOpt::env("NO_CLEANUP", "false"),
            StepOpt::env("INCLUDE_ADMIN_ONBOARDING", "false"),
        ];
        opts.extend(instance_env(&self.candidate_tag));
        opts.extend([
            StepOpt::annotated_cmd("dev/ci/integration/qa/run.sh", AnnotatedCmdOpts::annotations()),
            StepOpt::artifact_paths(VIDEO_ARTIFACTS),
        ]);
        pipeline.add_step(":docker::chromium: Sourcegraph QA", opts);
    }
}

/// Upgrade from the oldest supported release to the server candidate
#[derive(Debug, Clone)]
pub struct UpgradeTest {
    /// Candidate image tag under test
    pub candidate_tag: String,
    /// Release the upgrade starts from
    pub minimum_upgradeable_version: String,
}

impl Operation for UpgradeTest {
    fn name(&self) -> String {
        "upgrade test".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        let mut opts = vec![
            StepOpt::depends_on(candidate_image_step_key("server")),
            StepOpt::env("MINIMUM_UPGRADEABLE_VERSION", &self.minimum_upgradeable_version),
            StepOpt::env("DISPLAY", ":99"),
            StepOpt::env("LOG_STATUS_MESSAGES", "true"),
            StepOpt::env("NO_CLEANUP", "false"),
            StepOpt::env("INCLUDE_ADMIN_ONBOARDING", "false"),
        ];
        opts.extend(instance_env(&self.candidate_tag));
        opts.extend([
            StepOpt::cmd("dev/ci/integration/upgrade/run.sh"),
            StepOpt::artifact_paths(VIDEO_ARTIFACTS),
        ]);
        pipeline.add_step(":docker::arrow_double_up: Sourcegraph Upgrade", opts);
    }
}

/// QA of a cluster deployment built from every deployed candidate
#[derive(Debug, Clone)]
pub struct ClusterQa {
    /// Candidate image tag under test
    pub candidate_tag: String,
}

impl Operation for ClusterQa {
    fn name(&self) -> String {
        "cluster QA".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        let mut opts = vec![
            StepOpt::DependsOn(
                DEPLOY_SOURCEGRAPH_DOCKER_IMAGES
                    .iter()
                    .map(|app| candidate_image_step_key(app))
                    .collect(),
            ),
            StepOpt::env(
                "DOCKER_CLUSTER_IMAGES_TXT",
                DEPLOY_SOURCEGRAPH_DOCKER_IMAGES.join("\n"),
            ),
            StepOpt::env("NO_CLEANUP", "false"),
            StepOpt::env("INCLUDE_ADMIN_ONBOARDING", "false"),
        ];
        opts.extend(instance_env(&self.candidate_tag));
        opts.extend([
            StepOpt::cmd("./dev/ci/integration/cluster/run.sh"),
            StepOpt::artifact_paths(VIDEO_ARTIFACTS),
        ]);
        pipeline.add_step(":k8s: Sourcegraph Cluster (deploy-sourcegraph) QA", opts);
    }
}

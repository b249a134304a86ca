//! Docker image builds, scans and publishing
//!
//! Images are first built and pushed to the internal registry under a
//! candidate tag. Tests run against the candidates; once they pass the
//! candidates are retagged and pushed under their final tags.

use crate::config::Config;
use crate::images::{candidate_image_step_key, dev_image, publish_image};
use crate::operations::Operation;
use crate::runtype::RunType;
use crate::settings::Registries;
use pipegen_buildkite::{
    AnnotatedCmdOpts, AnnotationOpts, AnnotationType, PipelineBuilder, StepOpt,
};
use std::path::Path;

/// Exit status of the build scripts when the push failed
const PUSH_FAILED_EXIT_STATUS: i32 = 10;
/// Exit status used by scripts for retryable infrastructure failures
const FLAKE_EXIT_STATUS: i32 = 222;
/// Exit status trivy uses when it finds a vulnerability
pub const VULNERABILITY_EXIT_STATUS: i32 = 27;

#[derive(Debug, Clone, PartialEq, Eq)]
enum BuildScript {
    /// `docker-images/<app>/build.sh`
    DockerImages(String),
    /// `[enterprise/]cmd/<app>/build.sh`, optionally preceded by `pre-build.sh`
    Cmd { dir: String, pre_build: bool },
}

impl BuildScript {
    fn locate(repo_root: &Path, app: &str) -> Self {
        let docker_images = format!("docker-images/{app}");
        if repo_root.join(&docker_images).exists() {
            return Self::DockerImages(docker_images);
        }

        let enterprise = format!("enterprise/cmd/{app}");
        let dir = if repo_root.join(&enterprise).exists() {
            enterprise
        } else {
            format!("cmd/{app}")
        };
        let pre_build = repo_root.join(&dir).join("pre-build.sh").exists();
        Self::Cmd { dir, pre_build }
    }

    fn push_commands(&self, opts: &mut Vec<StepOpt>) {
        let annotations = AnnotatedCmdOpts {
            annotations: Some(AnnotationOpts {
                kind: AnnotationType::Info,
                include_names: true,
                multi_job_context: None,
            }),
            test_reports: None,
        };
        match self {
            Self::DockerImages(dir) => {
                opts.push(StepOpt::cmd(format!("ls -lah {dir}/build.sh")));
                opts.push(StepOpt::cmd(format!("{dir}/build.sh")));
            }
            Self::Cmd { dir, pre_build } => {
                if *pre_build {
                    opts.push(StepOpt::annotated_cmd(
                        format!("{dir}/pre-build.sh"),
                        annotations.clone(),
                    ));
                }
                opts.push(StepOpt::annotated_cmd(format!("{dir}/build.sh"), annotations));
            }
        }
    }
}

/// Builds the candidate image of an app and pushes it to the internal
/// registry
#[derive(Debug, Clone)]
pub struct CandidateImage {
    app: String,
    version: String,
    dev_image: String,
    upload_sourcemaps: bool,
    script: BuildScript,
}

impl CandidateImage {
    /// Locate the build script of `app` in the build's checkout
    #[must_use]
    pub fn new(
        app: &str,
        config: &Config,
        registries: &Registries,
        upload_sourcemaps: bool,
    ) -> Self {
        Self {
            app: app.to_string(),
            version: config.version.clone(),
            dev_image: dev_image(registries, app, &config.candidate_image_tag()),
            upload_sourcemaps,
            script: BuildScript::locate(&config.repo_root, app),
        }
    }
}

impl Operation for CandidateImage {
    fn name(&self) -> String {
        format!("build {}", self.app)
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        let local_image = format!("sourcegraph/{}:{}", self.app.replace('/', "-"), self.version);

        let mut opts = vec![
            StepOpt::key(candidate_image_step_key(&self.app)),
            StepOpt::cmd(format!("echo \"Building candidate {} image...\"", self.app)),
            StepOpt::env("DOCKER_BUILDKIT", "1"),
            StepOpt::env("IMAGE", &local_image),
            StepOpt::env("VERSION", &self.version),
        ];
        if self.upload_sourcemaps {
            opts.push(StepOpt::env("SENTRY_UPLOAD_SOURCE_MAPS", "1"));
            opts.push(StepOpt::env("SENTRY_ORGANIZATION", "sourcegraph"));
            opts.push(StepOpt::env("SENTRY_PROJECT", "sourcegraph-dot-com"));
        }

        self.script.push_commands(&mut opts);

        opts.extend([
            StepOpt::cmd(format!("docker tag {local_image} {}", self.dev_image)),
            StepOpt::cmd(format!(
                "docker push {} || exit {PUSH_FAILED_EXIT_STATUS}",
                self.dev_image
            )),
            StepOpt::AutomaticRetryStatus(3, PUSH_FAILED_EXIT_STATUS),
            StepOpt::AutomaticRetryStatus(3, FLAKE_EXIT_STATUS),
        ]);

        pipeline.add_step(format!(":docker: :construction: Build {}", self.app), opts);
    }
}

/// Scans a candidate image for high and critical vulnerabilities
#[derive(Debug, Clone)]
pub struct TrivyScan {
    app: String,
    image: String,
}

impl TrivyScan {
    /// Scan the candidate image of `app`
    #[must_use]
    pub fn new(app: &str, candidate_tag: &str, registries: &Registries) -> Self {
        Self {
            app: app.to_string(),
            image: dev_image(registries, app, candidate_tag),
        }
    }
}

impl Operation for TrivyScan {
    fn name(&self) -> String {
        format!("scan {}", self.app)
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            format!(":trivy: :docker: :mag: Scan {}", self.app),
            [
                StepOpt::depends_on(candidate_image_step_key(&self.app)),
                StepOpt::cmd(format!("docker pull {}", self.image)),
                // shorter name in trivy's output
                StepOpt::cmd(format!("docker tag {} {}", self.image, self.app)),
                StepOpt::env("IMAGE", &self.app),
                StepOpt::env("VULNERABILITY_EXIT_CODE", VULNERABILITY_EXIT_STATUS.to_string()),
                StepOpt::artifact_paths(["./*-security-report.html"]),
                StepOpt::SoftFail(vec![VULNERABILITY_EXIT_STATUS]),
                StepOpt::annotated_cmd(
                    "./dev/ci/trivy/trivy-scan-high-critical.sh",
                    AnnotatedCmdOpts {
                        annotations: Some(AnnotationOpts {
                            kind: AnnotationType::Warning,
                            include_names: false,
                            multi_job_context: Some("docker-security-scans".to_string()),
                        }),
                        test_reports: None,
                    },
                ),
            ],
        );
    }
}

/// Retags a tested candidate image with its final tags
#[derive(Debug, Clone)]
pub struct PublishFinalImage {
    app: String,
    candidate: String,
    targets: Vec<String>,
}

impl PublishFinalImage {
    /// Compute every tag `app` is published under for this build
    #[must_use]
    pub fn new(app: &str, config: &Config, registries: &Registries) -> Self {
        let dev = dev_image(registries, app, "");
        let publish = publish_image(registries, app, "");
        let run_type = config.run_type;

        let mut targets = Vec::new();
        for image in [&publish, &dev] {
            if app != "server"
                || run_type.is(&[
                    RunType::TaggedRelease,
                    RunType::ImagePatch,
                    RunType::ImagePatchNoTest,
                ])
            {
                targets.push(format!("{image}:{}", config.version));
            }
            if app == "server" && run_type == RunType::ReleaseBranch {
                targets.push(format!("{image}:{}-insiders", config.branch));
            }
            if run_type == RunType::MainBranch {
                targets.push(format!("{image}:insiders"));
            }
        }

        // internal tags, dev registry only
        let short = config.short_commit();
        let build = config.build_number;
        for tag in [
            config.version.clone(),
            config.commit.clone(),
            short.clone(),
            format!("{short}_{}_{build}", config.time.format("%Y-%m-%d")),
            format!("{short}_{build}"),
            format!("{}_{build}", config.commit),
            build.to_string(),
        ] {
            targets.push(format!("{dev}:{tag}"));
        }

        Self {
            app: app.to_string(),
            candidate: format!("{dev}:{}", config.candidate_image_tag()),
            targets,
        }
    }

    /// Images the candidate is pushed to
    #[must_use]
    pub fn targets(&self) -> &[String] {
        &self.targets
    }
}

impl Operation for PublishFinalImage {
    fn name(&self) -> String {
        format!("publish {}", self.app)
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            format!(":docker: :truck: {}", self.app),
            [
                // only registry flakes can fail a retag
                StepOpt::AutomaticRetry(3),
                StepOpt::cmd(format!(
                    "./dev/ci/docker-publish.sh {} {}",
                    self.candidate,
                    self.targets.join(" ")
                )),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::StaticGit;
    use crate::steps::testing::command_steps;
    use chrono::{TimeZone, Utc};
    use pipegen_buildkite::schema::{ExitStatus, SoftFail};
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

    fn config(root: &Path, branch: &str, tag: &str) -> Config {
        let env: HashMap<String, String> = [
            ("BUILDKITE_BRANCH", branch),
            ("BUILDKITE_TAG", tag),
            ("BUILDKITE_COMMIT", COMMIT),
            ("BUILDKITE_BUILD_NUMBER", "42"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let now = Utc.with_ymd_and_hms(2023, 4, 5, 0, 0, 0).unwrap();
        Config::compute(&env, &StaticGit::default(), now, root).unwrap()
    }

    #[test]
    fn test_candidate_from_docker_images() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("docker-images/grafana")).unwrap();
        let config = config(dir.path(), "main", "");

        let op = CandidateImage::new("grafana", &config, &Registries::default(), false);
        let steps = command_steps(&op);
        let step = &steps[0];

        assert_eq!(step.key.as_deref(), Some("grafana:candidate"));
        assert!(step.command.contains(&"./tr docker-images/grafana/build.sh".to_string()));
        assert!(step.command.last().unwrap().ends_with(&format!(
            "docker push us.gcr.io/sourcegraph-dev/grafana:{COMMIT}_42_candidate || exit 10"
        )));
        let retry = step.retry.as_ref().unwrap();
        let statuses: Vec<_> = retry.automatic.iter().map(|r| r.exit_status).collect();
        assert_eq!(statuses, vec![ExitStatus::Code(10), ExitStatus::Code(222)]);
        assert!(!step.env.contains_key("SENTRY_UPLOAD_SOURCE_MAPS"));
    }

    #[test]
    fn test_candidate_from_enterprise_cmd() {
        let dir = TempDir::new().unwrap();
        let cmd = dir.path().join("enterprise/cmd/frontend");
        fs::create_dir_all(&cmd).unwrap();
        fs::write(cmd.join("pre-build.sh"), "").unwrap();
        let config = config(dir.path(), "main", "");

        let op = CandidateImage::new("frontend", &config, &Registries::default(), true);
        let step = &command_steps(&op)[0];
        assert!(step.command.iter().any(|c| c.ends_with("./tr enterprise/cmd/frontend/pre-build.sh")));
        assert!(step.command.iter().any(|c| c.ends_with("./tr enterprise/cmd/frontend/build.sh")));
        assert_eq!(step.env["ANNOTATE_OPTS"], "true -t info");
        assert_eq!(step.env["SENTRY_UPLOAD_SOURCE_MAPS"], "1");
    }

    #[test]
    fn test_candidate_falls_back_to_cmd() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path(), "main", "");
        let op = CandidateImage::new("gitserver", &config, &Registries::default(), false);
        let step = &command_steps(&op)[0];
        assert!(step.command.iter().any(|c| c.ends_with("./tr cmd/gitserver/build.sh")));
        assert!(!step.command.iter().any(|c| c.contains("pre-build.sh")));
    }

    #[test]
    fn test_trivy_scan() {
        let op = TrivyScan::new("gitserver", "abc_1_candidate", &Registries::default());
        let step = &command_steps(&op)[0];
        assert_eq!(step.depends_on, vec!["gitserver:candidate"]);
        assert_eq!(
            step.command[0],
            "./tr docker pull us.gcr.io/sourcegraph-dev/gitserver:abc_1_candidate"
        );
        let Some(SoftFail::ExitStatuses(statuses)) = &step.soft_fail else {
            panic!("expected soft fail statuses");
        };
        assert_eq!(statuses[0].exit_status, 27);
    }

    #[test]
    fn test_publish_main_branch() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path(), "main", "");
        let op = PublishFinalImage::new("gitserver", &config, &Registries::default());
        let targets = op.targets();

        assert!(targets.contains(&format!("index.docker.io/sourcegraph/gitserver:{}", config.version)));
        assert!(targets.contains(&"index.docker.io/sourcegraph/gitserver:insiders".to_string()));
        assert!(targets.contains(&"us.gcr.io/sourcegraph-dev/gitserver:insiders".to_string()));
        assert!(targets.contains(&"us.gcr.io/sourcegraph-dev/gitserver:0123456789ab_2023-04-05_42".to_string()));
        assert!(targets.contains(&"us.gcr.io/sourcegraph-dev/gitserver:42".to_string()));

        let step = &command_steps(&op)[0];
        assert!(step.command[0].starts_with(&format!(
            "./tr ./dev/ci/docker-publish.sh us.gcr.io/sourcegraph-dev/gitserver:{COMMIT}_42_candidate "
        )));
    }

    #[test]
    fn test_publish_server_only_versioned_on_releases() {
        let dir = TempDir::new().unwrap();

        let main = config(dir.path(), "main", "");
        let op = PublishFinalImage::new("server", &main, &Registries::default());
        assert!(!op
            .targets()
            .contains(&format!("index.docker.io/sourcegraph/server:{}", main.version)));

        let release = config(dir.path(), "5.1", "v5.1.2");
        let op = PublishFinalImage::new("server", &release, &Registries::default());
        assert!(op.targets().contains(&"index.docker.io/sourcegraph/server:5.1.2".to_string()));

        let branch = config(dir.path(), "5.1", "");
        let op = PublishFinalImage::new("server", &branch, &Registries::default());
        assert!(op.targets().contains(&"index.docker.io/sourcegraph/server:5.1-insiders".to_string()));
    }
}

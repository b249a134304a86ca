//! Executor VM and docker registry mirror images

use crate::config::Config;
use crate::error::{Error, Result};
use crate::images::candidate_image_step_key;
use crate::operations::Operation;
use crate::runtype::RunType;
use pipegen_buildkite::{PipelineBuilder, StepOpt};

const EXECUTOR_VM_IMAGE: &str = "executor.vm-image";
const DOCKER_MIRROR_IMAGE: &str = "executor-docker-mirror.vm-image";

/// Exit status of the hash comparison when nothing changed
const UNCHANGED_EXIT_STATUS: i32 = 222;

/// Image family the executor images are published to: `<prefix>-nightly`,
/// or `<prefix>-<major>-<minor>` for tagged releases
pub fn image_family(prefix: &str, config: &Config) -> Result<String> {
    if config.run_type != RunType::TaggedRelease {
        return Ok(format!("{prefix}-nightly"));
    }
    let version =
        semver::Version::parse(&config.version).map_err(|source| Error::InvalidVersion {
            version: config.version.clone(),
            source,
        })?;
    Ok(format!("{prefix}-{}-{}", version.major, version.minor))
}

/// Which of the two executor images an operation handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorImage {
    /// The VM image executors run jobs in
    Vm,
    /// The docker registry mirror VM image
    DockerMirror,
}

impl ExecutorImage {
    fn family_prefix(self) -> &'static str {
        match self {
            Self::Vm => "sourcegraph-executors",
            Self::DockerMirror => "sourcegraph-executors-docker-mirror",
        }
    }

    fn step_key(self) -> String {
        candidate_image_step_key(match self {
            Self::Vm => EXECUTOR_VM_IMAGE,
            Self::DockerMirror => DOCKER_MIRROR_IMAGE,
        })
    }

    fn script_dir(self) -> &'static str {
        match self {
            Self::Vm => "./enterprise/cmd/executor/vm-image",
            Self::DockerMirror => "./enterprise/cmd/executor/docker-mirror",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Vm => "executor image",
            Self::DockerMirror => "docker registry mirror image",
        }
    }
}

/// Builds an executor image with packer
///
/// The VM image is only rebuilt when its inputs changed, unless hash
/// comparison is skipped; the mirror image is always rebuilt.
#[derive(Debug, Clone)]
pub struct BuildExecutorImage {
    image: ExecutorImage,
    version: String,
    family: String,
    compare_hash: bool,
}

impl BuildExecutorImage {
    /// Build `image` for this build's version
    pub fn new(image: ExecutorImage, config: &Config, skip_hash_compare: bool) -> Result<Self> {
        Ok(Self {
            image,
            version: config.version.clone(),
            family: image_family(image.family_prefix(), config)?,
            compare_hash: image == ExecutorImage::Vm && !skip_hash_compare,
        })
    }
}

impl Operation for BuildExecutorImage {
    fn name(&self) -> String {
        format!("build {} ({})", self.image.description(), self.family)
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        let mut opts = vec![
            StepOpt::key(self.image.step_key()),
            StepOpt::env("VERSION", &self.version),
            StepOpt::env("IMAGE_FAMILY", &self.family),
        ];
        if self.compare_hash {
            opts.push(StepOpt::SoftFail(vec![UNCHANGED_EXIT_STATUS]));
            opts.push(StepOpt::cmd(
                "./enterprise/dev/ci/scripts/compare-hash.sh ./enterprise/cmd/executor/hash.sh",
            ));
        }
        opts.push(StepOpt::cmd(format!("{}/build.sh", self.image.script_dir())));

        pipeline.add_step(
            format!(":packer: :construction: Build {}", self.image.description()),
            opts,
        );
    }
}

/// Releases a built executor image
#[derive(Debug, Clone)]
pub struct PublishExecutorImage {
    image: ExecutorImage,
    version: String,
    family: String,
    check_dependency: bool,
}

impl PublishExecutorImage {
    /// Publish `image` once its build step finished
    pub fn new(image: ExecutorImage, config: &Config, skip_hash_compare: bool) -> Result<Self> {
        Ok(Self {
            image,
            version: config.version.clone(),
            family: image_family(image.family_prefix(), config)?,
            check_dependency: image == ExecutorImage::Vm && !skip_hash_compare,
        })
    }
}

impl Operation for PublishExecutorImage {
    fn name(&self) -> String {
        format!("publish {} ({})", self.image.description(), self.family)
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        let build_key = self.image.step_key();
        let mut opts = vec![
            StepOpt::depends_on(&build_key),
            StepOpt::env("VERSION", &self.version),
            StepOpt::env("IMAGE_FAMILY", &self.family),
        ];
        if self.check_dependency {
            // nothing to publish when the build soft-failed
            opts.push(StepOpt::SoftFail(vec![UNCHANGED_EXIT_STATUS]));
            opts.push(StepOpt::cmd(format!(
                "./enterprise/dev/ci/scripts/check-dependency-soft-fail.sh {build_key}"
            )));
        }
        opts.push(StepOpt::cmd(format!("{}/release.sh", self.image.script_dir())));

        pipeline.add_step(
            format!(":packer: :white_check_mark: Publish {}", self.image.description()),
            opts,
        );
    }
}

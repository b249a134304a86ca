//! Wolfi packages and base images
//!
//! Package definitions live in `wolfi-packages/<name>.yaml` and base image
//! definitions in `wolfi-images/<name>.yaml`. Packages are built first, then
//! indexed into a repository the base image builds install from.

use super::sanitize_step_key;
use crate::operations::Operation;
use pipegen_buildkite::{PipelineBuilder, StepOpt};
use std::path::Path;
use tracing::{debug, warn};

/// Key of the package repository index step
pub const REPO_INDEX_KEY: &str = "buildRepoIndex";
/// Key of the step waiting for every base image
pub const ALL_BASE_IMAGES_KEY: &str = "buildAllBaseImages";

const SCRIPTS: &str = "./enterprise/dev/ci/scripts/wolfi";
const UNCHANGED_EXIT_STATUS: i32 = 222;

fn package_key(name: &str) -> String {
    sanitize_step_key(&format!("package-dependency-{name}"))
}

fn base_image_key(name: &str) -> String {
    sanitize_step_key(&format!("build-base-image-{name}"))
}

/// Names of every base image defined under `wolfi-images/`
#[must_use]
pub fn discover_base_images(repo_root: &Path) -> Vec<String> {
    let pattern = repo_root.join("wolfi-images").join("*.yaml");
    let mut names = Vec::new();
    match glob::glob(&pattern.to_string_lossy()) {
        Ok(paths) => {
            for path in paths.flatten() {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        Err(err) => warn!(%err, "invalid base image pattern"),
    }
    names.sort();
    debug!(images = names.len(), "discovered wolfi base images");
    names
}

/// Builds one Wolfi package
#[derive(Debug, Clone)]
pub struct WolfiPackage {
    name: String,
    queue: String,
}

impl WolfiPackage {
    /// Build package `name` on agents of `queue`
    #[must_use]
    pub fn new(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
        }
    }
}

impl Operation for WolfiPackage {
    fn name(&self) -> String {
        format!("package {}", self.name)
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            format!(":package: Package dependency '{}'", self.name),
            [
                StepOpt::cmd(format!("{SCRIPTS}/build-package.sh {}", self.name)),
                StepOpt::agent("queue", &self.queue),
                StepOpt::key(package_key(&self.name)),
                StepOpt::SoftFail(vec![UNCHANGED_EXIT_STATUS]),
            ],
        );
    }
}

/// Indexes the built packages into a package repository
#[derive(Debug, Clone)]
pub struct WolfiRepoIndex {
    packages: Vec<String>,
}

impl WolfiRepoIndex {
    /// Index once every package in `packages` was built
    #[must_use]
    pub fn new(packages: &[String]) -> Self {
        Self {
            packages: packages.to_vec(),
        }
    }
}

impl Operation for WolfiRepoIndex {
    fn name(&self) -> String {
        "package repository index".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":card_index_dividers: Build and sign repository index",
            [
                StepOpt::cmd(format!("{SCRIPTS}/build-repo-index.sh")),
                StepOpt::key(REPO_INDEX_KEY),
                StepOpt::DependsOn(self.packages.iter().map(|p| package_key(p)).collect()),
            ],
        );
    }
}

/// Builds one Wolfi base image
#[derive(Debug, Clone)]
pub struct WolfiBaseImage {
    name: String,
    tag: String,
    queue: String,
    after_packages: bool,
}

impl WolfiBaseImage {
    /// Build base image `name` tagged `tag`
    ///
    /// With `after_packages` the build waits for the repository index, so it
    /// installs the freshly built packages.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        tag: impl Into<String>,
        queue: impl Into<String>,
        after_packages: bool,
    ) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            queue: queue.into(),
            after_packages,
        }
    }
}

impl Operation for WolfiBaseImage {
    fn name(&self) -> String {
        format!("base image {}", self.name)
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        let mut opts = vec![
            StepOpt::cmd(format!(
                "{SCRIPTS}/build-base-image.sh {} {}",
                self.name, self.tag
            )),
            StepOpt::agent("queue", &self.queue),
            StepOpt::key(base_image_key(&self.name)),
            StepOpt::SoftFail(vec![UNCHANGED_EXIT_STATUS]),
        ];
        if self.after_packages {
            opts.push(StepOpt::depends_on(REPO_INDEX_KEY));
        }
        pipeline.add_step(
            format!(":octopus: Build Wolfi base image '{}'", self.name),
            opts,
        );
    }
}

/// Marks the point where every base image is built
#[derive(Debug, Clone)]
pub struct AllBaseImagesBuilt {
    images: Vec<String>,
}

impl AllBaseImagesBuilt {
    /// Wait for every image in `images`
    #[must_use]
    pub fn new(images: &[String]) -> Self {
        Self {
            images: images.to_vec(),
        }
    }
}

impl Operation for AllBaseImagesBuilt {
    fn name(&self) -> String {
        "all base images built".to_string()
    }

    fn apply(&self, pipeline: &mut PipelineBuilder) {
        pipeline.add_step(
            ":octopus: All base images built",
            [
                StepOpt::raw_cmd("echo 'All base images built'"),
                StepOpt::key(ALL_BASE_IMAGES_KEY),
                StepOpt::DependsOn(self.images.iter().map(|i| base_image_key(i)).collect()),
            ],
        );
    }
}

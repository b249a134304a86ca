//! Docker images built by the pipeline and their names

use crate::error::{Error, Result};
use crate::settings::Registries;

/// Images the test suites run against; built before everything else
pub const SOURCEGRAPH_DOCKER_IMAGES_TEST_DEPS: &[&str] = &[
    "server",
    "executor",
    "executor-kubernetes",
    "batcheshelper",
];

/// Images deployed by the Kubernetes and Docker Compose distributions
pub const DEPLOY_SOURCEGRAPH_DOCKER_IMAGES: &[&str] = &[
    "alpine-3.14",
    "cadvisor",
    "codeinsights-db",
    "codeintel-db",
    "frontend",
    "github-proxy",
    "gitserver",
    "grafana",
    "indexed-searcher",
    "migrator",
    "node-exporter",
    "opentelemetry-collector",
    "postgres-12-alpine",
    "postgres_exporter",
    "precise-code-intel-worker",
    "prometheus",
    "prometheus-gcp",
    "redis-cache",
    "redis-store",
    "redis_exporter",
    "repo-updater",
    "search-indexer",
    "searcher",
    "symbols",
    "syntax-highlighter",
    "worker",
    "blobstore",
    "embeddings",
];

/// Images that are neither test dependencies nor deployed
pub const SOURCEGRAPH_DOCKER_IMAGES_MISC: &[&str] = &["dind", "executor-vm", "sg", "cody-gateway"];

/// Every image built by a full build, test dependencies first
pub fn sourcegraph_docker_images() -> impl Iterator<Item = &'static str> {
    SOURCEGRAPH_DOCKER_IMAGES_TEST_DEPS
        .iter()
        .chain(DEPLOY_SOURCEGRAPH_DOCKER_IMAGES)
        .chain(SOURCEGRAPH_DOCKER_IMAGES_MISC)
        .copied()
}

/// Check that `app` is one of [`sourcegraph_docker_images`]
pub fn ensure_known_image(app: &str) -> Result<()> {
    if sourcegraph_docker_images().any(|image| image == app) {
        Ok(())
    } else {
        Err(Error::UnknownImage {
            image: app.to_string(),
        })
    }
}

fn maybe_tagged(root: String, tag: &str) -> String {
    if tag.is_empty() {
        root
    } else {
        format!("{root}:{tag}")
    }
}

/// `app` in the internal registry, tagged when `tag` is not empty
#[must_use]
pub fn dev_image(registries: &Registries, app: &str, tag: &str) -> String {
    maybe_tagged(format!("{}/{app}", registries.dev), tag)
}

/// `app` in the public registry, tagged when `tag` is not empty
#[must_use]
pub fn publish_image(registries: &Registries, app: &str, tag: &str) -> String {
    maybe_tagged(format!("{}/{app}", registries.publish), tag)
}

/// Key of the step building the candidate image of `app`
#[must_use]
pub fn candidate_image_step_key(app: &str) -> String {
    format!("{}:candidate", app.replace('.', "-"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_image_names() {
        let registries = Registries::default();
        assert_eq!(
            dev_image(&registries, "gitserver", "abc_1_candidate"),
            "us.gcr.io/sourcegraph-dev/gitserver:abc_1_candidate"
        );
        assert_eq!(
            publish_image(&registries, "gitserver", ""),
            "index.docker.io/sourcegraph/gitserver"
        );
    }

    #[test]
    fn test_candidate_step_key() {
        assert_eq!(candidate_image_step_key("server"), "server:candidate");
        assert_eq!(
            candidate_image_step_key("executor.vm-image"),
            "executor-vm-image:candidate"
        );
    }

    #[test]
    fn test_known_images() {
        assert!(ensure_known_image("gitserver").is_ok());
        assert!(matches!(
            ensure_known_image("nope"),
            Err(Error::UnknownImage { .. })
        ));
    }

    #[test]
    fn test_no_duplicate_images() {
        let all: Vec<_> = sourcegraph_docker_images().collect();
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), unique.len());
    }
}

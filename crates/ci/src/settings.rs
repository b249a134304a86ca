//! Generator settings
//!
//! Everything that used to be a package-level constant or registry lives here
//! and is handed to the pipeline builder explicitly. Settings are read from an
//! optional TOML file; every key has a default.
//!
//! ```toml
//! minimum_upgradeable_version = "5.0.0"
//!
//! [registries]
//! dev = "us.gcr.io/sourcegraph-dev"
//!
//! [queues]
//! bazel = "bazel"
//!
//! [cache]
//! backend = "gcs"
//! bucket = "my-cache"
//! ```

use crate::error::{Error, Result};
use pipegen_buildkite::CacheSettings;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// Docker registries images are pushed to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Registries {
    /// Internal registry receiving candidate and internal tags
    pub dev: String,
    /// Public registry receiving release tags
    pub publish: String,
}

impl Default for Registries {
    fn default() -> Self {
        Self {
            dev: "us.gcr.io/sourcegraph-dev".to_string(),
            publish: "index.docker.io/sourcegraph".to_string(),
        }
    }
}

/// Agent queues steps are scheduled on
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentQueues {
    /// Queue for ordinary steps
    pub stateless: String,
    /// Queue for bazel and Wolfi steps
    pub bazel: String,
}

impl Default for AgentQueues {
    fn default() -> Self {
        Self {
            stateless: "stateless".to_string(),
            bazel: "bazel".to_string(),
        }
    }
}

/// Settings of the generator
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Docker registries
    pub registries: Registries,
    /// Agent queues
    pub queues: AgentQueues,
    /// Cache plugin configuration
    pub cache: CacheSettings,
    /// Timeout applied to steps that set none
    pub default_timeout_minutes: u32,
    /// Oldest version instances can upgrade from
    pub minimum_upgradeable_version: String,
    /// Pipeline triggered for the slow async checks
    pub async_pipeline: String,
    /// Pipeline triggered for release branch healthchecks
    pub healthcheck_pipeline: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registries: Registries::default(),
            queues: AgentQueues::default(),
            cache: CacheSettings::default(),
            default_timeout_minutes: 60,
            minimum_upgradeable_version: "5.0.0".to_string(),
            async_pipeline: "sourcegraph-async".to_string(),
            healthcheck_pipeline: "sourcegraph".to_string(),
        }
    }
}

impl Settings {
    /// Parse settings from TOML text
    pub fn from_toml(path: &Path, text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| Error::Settings {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading settings");
        let text = std::fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
        Self::from_toml(path, &text)
    }

    /// Load settings from `path`, or use the defaults when there is none
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipegen_buildkite::CacheBackend;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.registries.dev, "us.gcr.io/sourcegraph-dev");
        assert_eq!(settings.registries.publish, "index.docker.io/sourcegraph");
        assert_eq!(settings.queues.bazel, "bazel");
        assert_eq!(settings.default_timeout_minutes, 60);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = Settings::from_toml(
            Path::new("pipegen.toml"),
            r#"
minimum_upgradeable_version = "5.2.0"

[registries]
dev = "registry.local/dev"

[cache]
backend = "gcs"
"#,
        )
        .unwrap();

        assert_eq!(settings.minimum_upgradeable_version, "5.2.0");
        assert_eq!(settings.registries.dev, "registry.local/dev");
        assert_eq!(settings.registries.publish, "index.docker.io/sourcegraph");
        assert_eq!(settings.cache.backend, CacheBackend::Gcs);
        assert_eq!(settings.cache.bucket, "sourcegraph_buildkite_cache");
    }

    #[test]
    fn test_invalid_file() {
        let err = Settings::from_toml(Path::new("pipegen.toml"), "default_timeout_minutes = \"x\"")
            .unwrap_err();
        assert!(matches!(err, Error::Settings { .. }));
    }

    #[test]
    fn test_load_optional() {
        assert_eq!(Settings::load_optional(None).unwrap(), Settings::default());

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipegen.toml");
        fs::write(&path, "default_timeout_minutes = 90\n").unwrap();
        let settings = Settings::load_optional(Some(&path)).unwrap();
        assert_eq!(settings.default_timeout_minutes, 90);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Settings::load_optional(Some(&missing)),
            Err(Error::Io { .. })
        ));
    }
}

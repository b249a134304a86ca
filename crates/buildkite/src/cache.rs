//! Cache plugin configuration.
//!
//! Steps ask for a cache with [`CacheOptions`]; where the cache is stored is
//! decided once per pipeline by [`CacheSettings`].

use serde::Deserialize;
use serde_json::{Value, json};

/// Storage backend used by the cache plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Amazon S3 (or any S3 compatible endpoint)
    #[default]
    S3,
    /// Google Cloud Storage
    Gcs,
    /// Local agent storage
    Tarball,
}

impl CacheBackend {
    const fn as_str(self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::Gcs => "gcs",
            Self::Tarball => "tarball",
        }
    }
}

/// Pipeline-wide cache plugin settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Plugin reference, including its version
    pub plugin: String,
    /// Storage backend
    pub backend: CacheBackend,
    /// Bucket holding the cache archives
    pub bucket: String,
    /// Storage region
    pub region: String,
    /// Storage endpoint
    pub endpoint: String,
    /// Credentials profile
    pub profile: String,
    /// Number of archives kept per key when using the tarball backend
    pub max_archives: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            plugin: "gencer/cache#v2.4.10".to_string(),
            backend: CacheBackend::S3,
            bucket: "sourcegraph_buildkite_cache".to_string(),
            region: "us-central1".to_string(),
            endpoint: "https://storage.googleapis.com".to_string(),
            profile: "buildkite".to_string(),
            max_archives: 5,
        }
    }
}

/// What a single step wants cached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Cache identifier
    pub id: String,
    /// Cache key template, e.g. `cache-node_modules-{{ checksum 'pnpm-lock.yaml' }}`
    pub key: String,
    /// Fallback keys tried in order when `key` misses
    pub restore_keys: Vec<String>,
    /// Paths to cache
    pub paths: Vec<String>,
    /// Compress archives before upload
    pub compress: bool,
}

impl CacheSettings {
    /// Build the plugin configuration block for a step.
    #[must_use]
    pub fn plugin_config(&self, options: &CacheOptions) -> Value {
        let mut config = json!({
            "id": options.id,
            "backend": self.backend.as_str(),
            "key": options.key,
            "restore_keys": options.restore_keys,
            "compress": options.compress,
            "paths": options.paths,
        });

        match self.backend {
            CacheBackend::S3 | CacheBackend::Gcs => {
                config[self.backend.as_str()] = json!({
                    "bucket": self.bucket,
                    "profile": self.profile,
                    "endpoint": self.endpoint,
                    "region": self.region,
                });
            }
            CacheBackend::Tarball => {
                config["tarball"] = json!({
                    "path": "/tmp/buildkite-cache",
                    "max": self.max_archives,
                });
            }
        }

        config
    }
}

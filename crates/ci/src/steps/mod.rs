//! Pipeline step builders
//!
//! Each type here is an [`Operation`](crate::operations::Operation) adding one
//! kind of step. Anything that depends on the repository checkout (which build
//! script an image uses, which test files exist) is looked up when the
//! operation is constructed, so applying an operation cannot fail.

pub mod backend;
pub mod client;
pub mod docker;
pub mod executors;
pub mod integration;
pub mod lint;
pub mod misc;
pub mod wolfi;

use pipegen_buildkite::{CacheOptions, StepOpt};

/// Suite key variable for frontend unit test reports
pub const FRONTEND_UNIT_TEST_SUITE: &str = "BUILDKITE_ANALYTICS_FRONTEND_UNIT_TEST_SUITE_API_KEY";

/// Installs node dependencies, tolerating slow registries
pub const PNPM_INSTALL: &str = "pnpm install --frozen-lockfile --fetch-timeout 60000";

const PNPM_CACHE_KEY: &str = "cache-node_modules-{{ checksum 'pnpm-lock.yaml' }}";

/// Cache `node_modules`, keyed on the pnpm lockfile
#[must_use]
pub fn pnpm_cache() -> StepOpt {
    StepOpt::Cache(CacheOptions {
        id: "node_modules".to_string(),
        key: PNPM_CACHE_KEY.to_string(),
        restore_keys: vec![PNPM_CACHE_KEY.to_string()],
        paths: vec![
            "node_modules".to_string(),
            "client/web/node_modules".to_string(),
            "client/browser/node_modules".to_string(),
            "client/shared/node_modules".to_string(),
        ],
        compress: false,
    })
}

/// Keep characters allowed in step keys, replace the rest with `-`
#[must_use]
pub fn sanitize_step_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

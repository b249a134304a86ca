//! Run type classification
//!
//! A build is classified once, from its tag, branch and environment, by
//! walking [`RUN_TYPES`] in precedence order. The first matcher that accepts
//! the build wins; [`RunType::PullRequest`] is the fallback.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::{LazyLock, Mutex, PoisonError};
use tracing::{debug, warn};

static BRANCH_PATTERNS: LazyLock<Mutex<HashMap<&'static str, Option<Regex>>>> =
    LazyLock::new(Mutex::default);

/// Compiled branch pattern; each pattern is compiled once
fn branch_pattern(pattern: &'static str) -> Option<Regex> {
    let mut patterns = BRANCH_PATTERNS
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    patterns
        .entry(pattern)
        .or_insert_with(|| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(err) => {
                warn!(pattern, %err, "invalid branch pattern");
                None
            }
        })
        .clone()
}

/// Classification of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunType {
    /// Pull request build, the default
    PullRequest,
    /// Build triggered by someone outside the organisation
    ManuallyTriggered,
    /// Nightly healthcheck of the release branches
    ReleaseNightly,
    /// Nightly browser extension build
    BextNightly,
    /// Manually requested browser extension nightly build
    BextManualNightly,
    /// App release
    AppRelease,
    /// App insiders release
    AppInsiders,
    /// Rebuild of every Wolfi base image
    WolfiBaseRebuild,
    /// Tagged release
    TaggedRelease,
    /// Release branch, e.g. `5.1`
    ReleaseBranch,
    /// Browser extension release
    BextReleaseBranch,
    /// VS Code extension release
    VsceReleaseBranch,
    /// Main branch
    MainBranch,
    /// Build everything main would, without publishing anywhere public
    MainDryRun,
    /// Build, test and publish a single image
    ImagePatch,
    /// Build and publish a single image without testing
    ImagePatchNoTest,
    /// Build and publish executor images without testing
    ExecutorPatchNoTest,
    /// Build every candidate image without testing
    CandidatesNoTest,
    /// Backend integration tests against a fresh server image
    BackendIntegrationTests,
    /// Run a bazel command taken from the commit message
    BazelDo,
}

/// Declarative test deciding whether a build has a given run type
///
/// Only the first configured criterion is consulted: branch, then tag, then
/// environment. A matcher without any criterion never matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matcher {
    /// Branch prefix, exact branch name, or regex (see the flags below)
    pub branch: &'static str,
    /// `branch` must equal the branch exactly
    pub branch_exact: bool,
    /// `branch` is a regular expression
    pub branch_regexp: bool,
    /// Branches must carry an argument after the prefix
    pub branch_argument_required: bool,
    /// Tag prefix
    pub tag_prefix: &'static str,
    /// Environment variables that must all be present with these values
    pub env_includes: &'static [(&'static str, &'static str)],
}

impl Matcher {
    const NONE: Self = Self {
        branch: "",
        branch_exact: false,
        branch_regexp: false,
        branch_argument_required: false,
        tag_prefix: "",
        env_includes: &[],
    };

    const fn branch_prefix(prefix: &'static str) -> Self {
        Self {
            branch: prefix,
            ..Self::NONE
        }
    }

    const fn branch_prefix_with_argument(prefix: &'static str) -> Self {
        Self {
            branch: prefix,
            branch_argument_required: true,
            ..Self::NONE
        }
    }

    const fn branch_exact(branch: &'static str) -> Self {
        Self {
            branch,
            branch_exact: true,
            ..Self::NONE
        }
    }

    const fn branch_regexp(pattern: &'static str) -> Self {
        Self {
            branch: pattern,
            branch_regexp: true,
            ..Self::NONE
        }
    }

    const fn tag_prefix(prefix: &'static str) -> Self {
        Self {
            tag_prefix: prefix,
            ..Self::NONE
        }
    }

    const fn env(env: &'static [(&'static str, &'static str)]) -> Self {
        Self {
            env_includes: env,
            ..Self::NONE
        }
    }

    /// Whether a build with this tag, branch and environment matches
    #[must_use]
    pub fn matches(&self, tag: &str, branch: &str, env: &HashMap<String, String>) -> bool {
        if !self.branch.is_empty() {
            if self.branch_exact {
                return self.branch == branch;
            }
            if self.branch_regexp {
                return branch_pattern(self.branch).is_some_and(|re| re.is_match(branch));
            }
            return branch.starts_with(self.branch);
        }

        if !self.tag_prefix.is_empty() {
            return tag.starts_with(self.tag_prefix);
        }

        if !self.env_includes.is_empty() && !env.is_empty() {
            return self
                .env_includes
                .iter()
                .all(|(key, value)| env.get(*key).is_some_and(|got| got == value));
        }

        false
    }

    /// Whether this matcher is a plain branch prefix
    #[must_use]
    pub fn is_branch_prefix_matcher(&self) -> bool {
        !self.branch.is_empty() && !self.branch_exact && !self.branch_regexp
    }

    /// The argument carried by a prefix-matched branch
    ///
    /// `docker-images-patch/gitserver/fix` carries `gitserver`. A missing
    /// argument is an error only when the matcher requires one.
    pub fn extract_branch_argument(&self, branch: &str) -> Result<String> {
        if self.branch_regexp {
            return Err(Error::BranchArgument {
                branch: branch.to_string(),
                message: "unsupported matcher type".to_string(),
            });
        }

        match branch.split('/').nth(1) {
            Some(argument) if !argument.is_empty() => Ok(argument.to_string()),
            _ if self.branch_argument_required => Err(Error::BranchArgument {
                branch: branch.to_string(),
                message: "branch argument expected, but none found".to_string(),
            }),
            _ => Ok(String::new()),
        }
    }

    /// Human readable description, used by the generated docs
    #[must_use]
    pub fn describe(&self) -> String {
        if !self.branch.is_empty() {
            let kind = if self.branch_exact {
                "Branch named"
            } else if self.branch_regexp {
                "Branch matching"
            } else {
                "Branch prefixed with"
            };
            let mut description = format!("{kind} `{}`", self.branch);
            if self.branch_argument_required {
                description.push_str(" followed by a required argument");
            }
            return description;
        }
        if !self.tag_prefix.is_empty() {
            return format!("Tag prefixed with `{}`", self.tag_prefix);
        }
        if !self.env_includes.is_empty() {
            let pairs: Vec<String> = self
                .env_includes
                .iter()
                .map(|(key, value)| format!("`{key}={value}`"))
                .collect();
            return format!("Environment includes {}", pairs.join(", "));
        }
        "Default".to_string()
    }
}

/// A row of the run type table
#[derive(Debug, Clone, Copy)]
pub struct RunTypeEntry {
    /// The run type
    pub kind: RunType,
    /// How to recognise it
    pub matcher: Matcher,
    /// Display name
    pub name: &'static str,
}

/// Every run type in precedence order
pub static RUN_TYPES: &[RunTypeEntry] = &[
    RunTypeEntry {
        kind: RunType::PullRequest,
        matcher: Matcher::NONE,
        name: "Pull request",
    },
    RunTypeEntry {
        kind: RunType::ManuallyTriggered,
        matcher: Matcher::branch_prefix("_manually_triggered_external/"),
        name: "Manually Triggered External Build",
    },
    RunTypeEntry {
        kind: RunType::ReleaseNightly,
        matcher: Matcher::env(&[("RELEASE_NIGHTLY", "true")]),
        name: "Release branch nightly healthcheck build",
    },
    RunTypeEntry {
        kind: RunType::BextNightly,
        matcher: Matcher::env(&[("BEXT_NIGHTLY", "true")]),
        name: "Browser extension nightly release build",
    },
    RunTypeEntry {
        kind: RunType::BextManualNightly,
        matcher: Matcher::branch_prefix("bext/nightly/"),
        name: "Manually triggered browser extension nightly release build",
    },
    RunTypeEntry {
        kind: RunType::AppRelease,
        matcher: Matcher::branch_exact("app/release"),
        name: "App release build",
    },
    RunTypeEntry {
        kind: RunType::AppInsiders,
        matcher: Matcher::branch_exact("app/insiders"),
        name: "App insiders build",
    },
    RunTypeEntry {
        kind: RunType::WolfiBaseRebuild,
        matcher: Matcher::env(&[("WOLFI_BASE_REBUILD", "true")]),
        name: "Wolfi base images rebuild",
    },
    RunTypeEntry {
        kind: RunType::TaggedRelease,
        matcher: Matcher::tag_prefix("v"),
        name: "Tagged release",
    },
    RunTypeEntry {
        kind: RunType::ReleaseBranch,
        matcher: Matcher::branch_regexp(r"^[0-9]+\.[0-9]+$"),
        name: "Release branch",
    },
    RunTypeEntry {
        kind: RunType::BextReleaseBranch,
        matcher: Matcher::branch_exact("bext/release"),
        name: "Browser extension release build",
    },
    RunTypeEntry {
        kind: RunType::VsceReleaseBranch,
        matcher: Matcher::branch_exact("vsce/release"),
        name: "VS Code extension release build",
    },
    RunTypeEntry {
        kind: RunType::MainBranch,
        matcher: Matcher::branch_exact("main"),
        name: "Main branch",
    },
    RunTypeEntry {
        kind: RunType::MainDryRun,
        matcher: Matcher::branch_prefix("main-dry-run/"),
        name: "Main dry run",
    },
    RunTypeEntry {
        kind: RunType::ImagePatch,
        matcher: Matcher::branch_prefix_with_argument("docker-images-patch/"),
        name: "Patch image",
    },
    RunTypeEntry {
        kind: RunType::ImagePatchNoTest,
        matcher: Matcher::branch_prefix_with_argument("docker-images-patch-notest/"),
        name: "Patch image without testing",
    },
    RunTypeEntry {
        kind: RunType::ExecutorPatchNoTest,
        matcher: Matcher::branch_prefix("executor-patch-notest/"),
        name: "Build executor without testing",
    },
    RunTypeEntry {
        kind: RunType::CandidatesNoTest,
        matcher: Matcher::branch_prefix("docker-images-candidates-notest/"),
        name: "Build all candidates without testing",
    },
    RunTypeEntry {
        kind: RunType::BackendIntegrationTests,
        matcher: Matcher::branch_prefix("backend-integration/"),
        name: "Backend integration tests",
    },
    RunTypeEntry {
        kind: RunType::BazelDo,
        matcher: Matcher::branch_prefix("bazel-do/"),
        name: "Bazel command",
    },
];

impl RunType {
    /// Classify a build
    #[must_use]
    pub fn compute(tag: &str, branch: &str, env: &HashMap<String, String>) -> Self {
        let kind = RUN_TYPES
            .iter()
            .filter(|entry| entry.kind != Self::PullRequest)
            .find(|entry| entry.matcher.matches(tag, branch, env))
            .map_or(Self::PullRequest, |entry| entry.kind);
        debug!(tag, branch, run_type = %kind, "computed run type");
        kind
    }

    /// Every run type in precedence order
    pub fn all() -> impl Iterator<Item = Self> {
        RUN_TYPES.iter().map(|entry| entry.kind)
    }

    fn entry(self) -> &'static RunTypeEntry {
        // Every variant has a row; PullRequest is the first one.
        RUN_TYPES
            .iter()
            .find(|entry| entry.kind == self)
            .unwrap_or(&RUN_TYPES[0])
    }

    /// How this run type is recognised
    #[must_use]
    pub fn matcher(self) -> Matcher {
        self.entry().matcher
    }

    /// Display name
    #[must_use]
    pub fn name(self) -> &'static str {
        self.entry().name
    }

    /// Whether this is one of `run_types`
    #[must_use]
    pub fn is(self, run_types: &[Self]) -> bool {
        run_types.contains(&self)
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for RunType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Names accepted by `pipegen branch`: every branch prefix without its
/// trailing slash
#[must_use]
pub fn build_type_arguments() -> Vec<&'static str> {
    RUN_TYPES
        .iter()
        .filter(|entry| entry.matcher.is_branch_prefix_matcher())
        .map(|entry| entry.matcher.branch.trim_end_matches('/'))
        .collect()
}

/// The branch to push `current_branch` to so that it builds as `run_type`
///
/// `run_type` is one of [`build_type_arguments`]. Run types that need an
/// argument take it from `argument`.
pub fn branch_for_run_type(
    run_type: &str,
    current_branch: &str,
    argument: Option<&str>,
) -> Result<(RunType, String)> {
    let kind = RunType::compute("", &format!("{run_type}/{current_branch}"), &HashMap::new());
    if kind == RunType::PullRequest {
        return Err(Error::UnsupportedRunType {
            name: run_type.to_string(),
            supported: build_type_arguments().join(", "),
        });
    }

    let matcher = kind.matcher();
    let mut branch = current_branch.to_string();
    if matcher.branch_argument_required {
        match argument.filter(|arg| !arg.is_empty()) {
            Some(arg) => branch = format!("{arg}/{branch}"),
            None => {
                return Err(Error::BranchArgument {
                    branch: format!("{}{branch}", matcher.branch),
                    message: "branch argument expected, but none found".to_string(),
                });
            }
        }
    }

    Ok((kind, format!("{}{branch}", matcher.branch)))
}

//! Build configuration
//!
//! Everything pipeline generation needs to know about the build, computed once
//! from the Buildkite environment and git.

use crate::changed::{ChangedFiles, Diff, parse_diff_in};
use crate::error::{Error, Result};
use crate::git::Git;
use crate::runtype::RunType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Commit used when the build does not name one
pub const PLACEHOLDER_COMMIT: &str = "1234567890123456789012345678901234567890";

/// Flags set through markers in the commit message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageFlags {
    /// `[buildkite-enable-profiling]`: profile every command
    pub profiling_enabled: bool,
    /// `[skip-hash-compare]`: rebuild executor images even when unchanged
    pub skip_hash_compare: bool,
    /// `[review-ready]`: run steps reserved for ready-for-review pull requests
    pub force_ready_for_review: bool,
    /// `[no-bazel]`: skip bazel steps
    pub no_bazel: bool,
}

impl MessageFlags {
    /// Read the markers present in `message`
    #[must_use]
    pub fn parse(message: &str) -> Self {
        Self {
            profiling_enabled: message.contains("[buildkite-enable-profiling]"),
            skip_hash_compare: message.contains("[skip-hash-compare]"),
            force_ready_for_review: message.contains("[review-ready]"),
            no_bazel: message.contains("[no-bazel]"),
        }
    }
}

/// Configuration of a single build
#[derive(Debug, Clone)]
pub struct Config {
    /// When generation started
    pub time: DateTime<Utc>,
    /// Branch being built
    pub branch: String,
    /// Tag being built, empty for branch builds
    pub tag: String,
    /// Version stamped into images and binaries
    pub version: String,
    /// Commit being built
    pub commit: String,
    /// Buildkite build number
    pub build_number: u64,
    /// Categories touched by the change
    pub diff: Diff,
    /// Per-category entries of the change
    pub changed_files: ChangedFiles,
    /// Classification of the build
    pub run_type: RunType,
    /// Commits of which at least one must be an ancestor of HEAD
    pub must_include_commit: Vec<String>,
    /// Commit message markers
    pub message_flags: MessageFlags,
    /// Raw commit message
    pub message: String,
    /// Repository the pull request comes from, if any
    pub pull_request_repo: String,
    /// Number of times this job has been retried
    pub retry_count: u32,
    /// Checkout the build runs in
    pub repo_root: PathBuf,
}

fn var<'a>(env: &'a HashMap<String, String>, key: &str) -> &'a str {
    env.get(key).map_or("", String::as_str)
}

fn number<T: std::str::FromStr + Default>(env: &HashMap<String, String>, key: &str) -> T {
    let value = var(env, key);
    if value.is_empty() {
        return T::default();
    }
    value.parse().unwrap_or_else(|_| {
        warn!(key, value, "ignoring non-numeric value");
        T::default()
    })
}

impl Config {
    /// Compute the configuration from a Buildkite environment
    pub fn compute(
        env: &HashMap<String, String>,
        git: &dyn Git,
        now: DateTime<Utc>,
        repo_root: &Path,
    ) -> Result<Self> {
        let branch = var(env, "BUILDKITE_BRANCH").to_string();
        let tag = var(env, "BUILDKITE_TAG").to_string();
        let message = var(env, "BUILDKITE_MESSAGE").to_string();
        let build_number: u64 = number(env, "BUILDKITE_BUILD_NUMBER");
        let run_type = RunType::compute(&tag, &branch, env);

        let mut commit = var(env, "BUILDKITE_COMMIT").to_string();
        let range = if commit.is_empty() {
            commit = PLACEHOLDER_COMMIT.to_string();
            "origin/main...".to_string()
        } else if run_type.is(&[RunType::MainBranch, RunType::MainDryRun]) {
            "@^".to_string()
        } else {
            format!("origin/main...{commit}")
        };

        let files = git.diff_names(&range)?;
        debug!(%range, files = files.len(), "listed changed files");
        let (diff, changed_files) = parse_diff_in(repo_root, &files);

        let version = compute_version(run_type, &tag, &commit, build_number, now);
        let must_include_commit = var(env, "MUST_INCLUDE_COMMIT")
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(ToString::to_string)
            .collect();

        info!(run_type = %run_type, %diff, %version, "computed build configuration");

        Ok(Self {
            time: now,
            branch,
            tag,
            version,
            commit,
            build_number,
            diff,
            changed_files,
            run_type,
            must_include_commit,
            message_flags: MessageFlags::parse(&message),
            message,
            pull_request_repo: var(env, "BUILDKITE_PULL_REQUEST_REPO").to_string(),
            retry_count: number(env, "BUILDKITE_RETRY_COUNT"),
            repo_root: repo_root.to_path_buf(),
        })
    }

    /// Compute the configuration from the process environment
    pub fn from_env(git: &dyn Git, repo_root: &Path) -> Result<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::compute(&env, git, Utc::now(), repo_root)
    }

    /// The first 12 characters of the commit
    #[must_use]
    pub fn short_commit(&self) -> String {
        self.commit.chars().take(12).collect()
    }

    /// Tag of the images built for this build before they are promoted
    #[must_use]
    pub fn candidate_image_tag(&self) -> String {
        candidate_image_tag(&self.commit, self.build_number)
    }

    /// Check that HEAD contains at least one of the required commits
    pub fn ensure_commit(&self, git: &dyn Git) -> Result<()> {
        if self.must_include_commit.is_empty() {
            return Ok(());
        }

        let mut details = Vec::new();
        for commit in &self.must_include_commit {
            match git.is_ancestor(commit, "HEAD") {
                Ok(()) => {
                    debug!(%commit, "required commit found");
                    return Ok(());
                }
                Err(err) => details.push(format!("{commit}: {err}")),
            }
        }

        Err(Error::MissingCommit {
            branch: self.branch.clone(),
            commit: self.commit.clone(),
            expected: self.must_include_commit.clone(),
            details: details.join("\n"),
        })
    }
}

/// `<commit>_<build>_candidate`
#[must_use]
pub fn candidate_image_tag(commit: &str, build_number: u64) -> String {
    format!("{commit}_{build_number}_candidate")
}

fn compute_version(
    run_type: RunType,
    tag: &str,
    commit: &str,
    build_number: u64,
    now: DateTime<Utc>,
) -> String {
    let mut version = if run_type == RunType::TaggedRelease {
        tag.trim_start_matches('v').to_string()
    } else {
        let short: String = commit.chars().take(12).collect();
        format!("{build_number:05}_{}_{short}", now.format("%Y-%m-%d"))
    };
    if run_type.is(&[
        RunType::ImagePatch,
        RunType::ImagePatchNoTest,
        RunType::ExecutorPatchNoTest,
    ]) {
        version.push_str("_patch");
    }
    version
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::StaticGit;
    use chrono::TimeZone;

    const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 5, 6, 7, 8).unwrap()
    }

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[derive(Default)]
    struct RecordingGit {
        ranges: std::cell::RefCell<Vec<String>>,
    }

    impl Git for RecordingGit {
        fn diff_names(&self, range: &str) -> Result<Vec<String>> {
            self.ranges.borrow_mut().push(range.to_string());
            Ok(vec!["main.go".to_string()])
        }

        fn is_ancestor(&self, _ancestor: &str, _descendant: &str) -> Result<()> {
            Ok(())
        }
    }

    fn compute(pairs: &[(&str, &str)]) -> (Config, Vec<String>) {
        let git = RecordingGit::default();
        let config = Config::compute(&env(pairs), &git, now(), Path::new("/nonexistent")).unwrap();
        (config, git.ranges.take())
    }

    #[test]
    fn test_pull_request() {
        let (config, ranges) = compute(&[
            ("BUILDKITE_BRANCH", "my-feature"),
            ("BUILDKITE_COMMIT", COMMIT),
            ("BUILDKITE_BUILD_NUMBER", "42"),
        ]);
        assert_eq!(config.run_type, RunType::PullRequest);
        assert_eq!(ranges, vec![format!("origin/main...{COMMIT}")]);
        assert!(config.diff.only(Diff::GO));
        assert_eq!(config.version, "00042_2023-04-05_0123456789ab");
        assert_eq!(config.short_commit(), "0123456789ab");
        assert_eq!(config.candidate_image_tag(), format!("{COMMIT}_42_candidate"));
    }

    #[test]
    fn test_main_diffs_against_parent() {
        let (config, ranges) = compute(&[("BUILDKITE_BRANCH", "main"), ("BUILDKITE_COMMIT", COMMIT)]);
        assert_eq!(config.run_type, RunType::MainBranch);
        assert_eq!(ranges, vec!["@^"]);
    }

    #[test]
    fn test_missing_commit_uses_placeholder() {
        let (config, ranges) = compute(&[("BUILDKITE_BRANCH", "my-feature")]);
        assert_eq!(config.commit, PLACEHOLDER_COMMIT);
        assert_eq!(ranges, vec!["origin/main..."]);
    }

    #[test]
    fn test_tagged_release_version() {
        let (config, _) = compute(&[
            ("BUILDKITE_BRANCH", "5.1"),
            ("BUILDKITE_TAG", "v5.1.2"),
            ("BUILDKITE_COMMIT", COMMIT),
        ]);
        assert_eq!(config.run_type, RunType::TaggedRelease);
        assert_eq!(config.version, "5.1.2");
    }

    #[test]
    fn test_patch_version_suffix() {
        let (config, _) = compute(&[
            ("BUILDKITE_BRANCH", "docker-images-patch/gitserver"),
            ("BUILDKITE_COMMIT", COMMIT),
            ("BUILDKITE_BUILD_NUMBER", "7"),
        ]);
        assert_eq!(config.version, "00007_2023-04-05_0123456789ab_patch");
    }

    #[test]
    fn test_message_flags() {
        let flags = MessageFlags::parse("fix things\n\n[skip-hash-compare] [review-ready]");
        assert!(flags.skip_hash_compare);
        assert!(flags.force_ready_for_review);
        assert!(!flags.profiling_enabled);
        assert!(!flags.no_bazel);

        let json = serde_json::to_value(flags).unwrap();
        assert_eq!(json["SkipHashCompare"], true);
    }

    #[test]
    fn test_invalid_numbers_default_to_zero() {
        let (config, _) = compute(&[
            ("BUILDKITE_BUILD_NUMBER", "abc"),
            ("BUILDKITE_RETRY_COUNT", "2"),
        ]);
        assert_eq!(config.build_number, 0);
        assert_eq!(config.retry_count, 2);
    }

    #[test]
    fn test_ensure_commit() {
        let (mut config, _) = compute(&[("BUILDKITE_BRANCH", "my-feature")]);
        let git = StaticGit::default().with_ancestor("bbb");

        assert!(config.ensure_commit(&git).is_ok());

        config.must_include_commit = vec!["aaa".to_string(), "bbb".to_string()];
        assert!(config.ensure_commit(&git).is_ok());

        config.must_include_commit = vec!["aaa".to_string(), "ccc".to_string()];
        let err = config.ensure_commit(&git).unwrap_err();
        let Error::MissingCommit {
            expected, details, ..
        } = &err
        else {
            panic!("expected MissingCommit, got {err:?}");
        };
        assert_eq!(expected, &["aaa", "ccc"]);
        assert!(details.contains("aaa: "));
        assert!(details.contains("ccc: "));
        assert!(err.to_string().contains("aaa, ccc"));
    }

    #[test]
    fn test_must_include_commit_parsing() {
        let (config, _) = compute(&[("MUST_INCLUDE_COMMIT", "aaa, bbb,,")]);
        assert_eq!(config.must_include_commit, vec!["aaa", "bbb"]);
    }

    #[test]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("BUILDKITE_BRANCH", Some("main-dry-run/test")),
                ("BUILDKITE_COMMIT", Some(COMMIT)),
                ("BUILDKITE_MESSAGE", Some("[no-bazel]")),
                ("BUILDKITE_PULL_REQUEST_REPO", Some("https://github.com/org/repo")),
                ("BUILDKITE_TAG", None),
                ("RELEASE_NIGHTLY", None),
            ],
            || {
                let git = StaticGit::new(["client/web/src/index.tsx"]);
                let config = Config::from_env(&git, Path::new("/nonexistent")).unwrap();
                assert_eq!(config.run_type, RunType::MainDryRun);
                assert!(config.diff.has(Diff::CLIENT));
                assert!(config.message_flags.no_bazel);
                assert_eq!(config.pull_request_repo, "https://github.com/org/repo");
            },
        );
    }
}

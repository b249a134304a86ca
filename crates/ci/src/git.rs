//! Git access
//!
//! The generator asks git two questions: which files changed in a range, and
//! whether a commit is an ancestor of another. [`GitCli`] answers them by
//! shelling out; [`StaticGit`] answers from fixed data.

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// The git queries pipeline generation relies on
pub trait Git {
    /// Files changed in `range`, as printed by `git diff --name-only`
    fn diff_names(&self, range: &str) -> Result<Vec<String>>;

    /// `Ok(())` when `ancestor` is an ancestor of `descendant`; otherwise an
    /// error carrying git's output
    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<()>;
}

/// Runs the `git` binary inside a checkout
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
}

impl GitCli {
    /// Run git commands in `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The checkout commands run in
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let command = args.join(" ");
        debug!(%command, root = %self.root.display(), "running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|err| Error::git(&command, err.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("{}{}", stdout.trim(), stderr.trim());
            return Err(Error::git(
                command,
                if message.is_empty() {
                    output.status.to_string()
                } else {
                    message
                },
            ));
        }
        Ok(stdout)
    }
}

impl Git for GitCli {
    fn diff_names(&self, range: &str) -> Result<Vec<String>> {
        let stdout = self.run(&["diff", "--name-only", range])?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<()> {
        self.run(&["merge-base", "--is-ancestor", ancestor, descendant])
            .map(|_| ())
    }
}

/// Git answers fixed in advance
///
/// Every range reports the same changed files; only the listed commits are
/// ancestors.
#[derive(Debug, Clone, Default)]
pub struct StaticGit {
    changed: Vec<String>,
    ancestors: BTreeSet<String>,
}

impl StaticGit {
    /// Report `changed` for every diff
    #[must_use]
    pub fn new<I, S>(changed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            changed: changed.into_iter().map(Into::into).collect(),
            ancestors: BTreeSet::new(),
        }
    }

    /// Treat `commit` as an ancestor of everything
    #[must_use]
    pub fn with_ancestor(mut self, commit: impl Into<String>) -> Self {
        self.ancestors.insert(commit.into());
        self
    }
}

impl Git for StaticGit {
    fn diff_names(&self, _range: &str) -> Result<Vec<String>> {
        Ok(self.changed.clone())
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<()> {
        if self.ancestors.contains(ancestor) {
            Ok(())
        } else {
            Err(Error::git(
                format!("merge-base --is-ancestor {ancestor} {descendant}"),
                format!("{ancestor} is not an ancestor of {descendant}"),
            ))
        }
    }
}

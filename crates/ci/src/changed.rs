//! Change classification
//!
//! Maps the files touched by a build to a [`Diff`] bitmask of change
//! categories. Optional pipeline operations are gated on these categories.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::ops::{BitOr, BitOrAssign};
use std::path::Path;
use tracing::debug;

/// Directories at the repository root that only contain Go code.
pub const TOP_LEVEL_GO_DIRS: &[&str] = &[
    "cmd",
    "enterprise/cmd",
    "enterprise/internal",
    "internal",
    "lib",
    "migrations",
    "monitoring",
    "schema",
];

/// Files at the repository root that configure the client build.
pub const ROOT_CLIENT_FILES: &[&str] = &[
    "package.json",
    "pnpm-lock.yaml",
    ".eslintrc.js",
    ".stylelintrc.json",
    "postcss.config.js",
    "tsconfig.json",
    "jest.config.base.js",
    "jest.config.js",
    "babel.config.js",
    ".percy.yml",
    "gulpfile.js",
    ".browserslistrc",
    ".mocharc.js",
];

/// Bytes read when sniffing for a shebang; `#!/usr/bin/env bash` is 19 long.
const SHEBANG_SNIFF_LEN: u64 = 19;

/// Bitmask of change categories
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Diff(u32);

impl Diff {
    /// Nothing changed
    pub const NONE: Self = Self(0);
    /// Go code or modules
    pub const GO: Self = Self(1 << 0);
    /// Client code and its build configuration
    pub const CLIENT: Self = Self(1 << 1);
    /// GraphQL schema
    pub const GRAPHQL: Self = Self(1 << 2);
    /// Database migrations
    pub const DATABASE_SCHEMA: Self = Self(1 << 3);
    /// Documentation and data files
    pub const DOCS: Self = Self(1 << 4);
    /// Dockerfiles
    pub const DOCKERFILES: Self = Self(1 << 5);
    /// Executor VM image
    pub const EXECUTOR_VM_IMAGE: Self = Self(1 << 6);
    /// Executor docker registry mirror
    pub const EXECUTOR_DOCKER_REGISTRY_MIRROR: Self = Self(1 << 7);
    /// CI scripts
    pub const CI_SCRIPTS: Self = Self(1 << 8);
    /// Terraform
    pub const TERRAFORM: Self = Self(1 << 9);
    /// SVG images
    pub const SVG: Self = Self(1 << 10);
    /// Shell scripts
    pub const SHELL: Self = Self(1 << 11);
    /// Anything under `docker-images/`
    pub const DOCKER_IMAGES: Self = Self(1 << 12);
    /// Wolfi package definitions
    pub const WOLFI_PACKAGES: Self = Self(1 << 13);
    /// Wolfi base image definitions
    pub const WOLFI_BASE_IMAGES: Self = Self(1 << 14);
    /// Protobuf definitions and generated code
    pub const PROTOBUF: Self = Self(1 << 15);
    /// The pnpm lockfile
    pub const PNPM: Self = Self(1 << 16);
    /// Every category
    pub const ALL: Self = Self((1 << 17) - 1);

    const CATEGORIES: [(Self, &'static str); 17] = [
        (Self::GO, "Go"),
        (Self::CLIENT, "Client"),
        (Self::GRAPHQL, "GraphQL"),
        (Self::DATABASE_SCHEMA, "DatabaseSchema"),
        (Self::DOCS, "Docs"),
        (Self::DOCKERFILES, "Dockerfiles"),
        (Self::EXECUTOR_VM_IMAGE, "ExecutorVMImage"),
        (Self::EXECUTOR_DOCKER_REGISTRY_MIRROR, "ExecutorDockerRegistryMirror"),
        (Self::CI_SCRIPTS, "CIScripts"),
        (Self::TERRAFORM, "Terraform"),
        (Self::SVG, "SVG"),
        (Self::SHELL, "Shell"),
        (Self::DOCKER_IMAGES, "DockerImages"),
        (Self::WOLFI_PACKAGES, "WolfiPackages"),
        (Self::WOLFI_BASE_IMAGES, "WolfiBaseImages"),
        (Self::PROTOBUF, "Protobuf"),
        (Self::PNPM, "Pnpm"),
    ];

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Every single category, in declaration order
    pub fn categories() -> impl Iterator<Item = Self> {
        Self::CATEGORIES.iter().map(|(diff, _)| *diff)
    }

    /// Name of a single category
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::NONE => Some("None"),
            Self::ALL => Some("All"),
            _ => Self::CATEGORIES
                .iter()
                .find(|(diff, _)| *diff == self)
                .map(|(_, name)| *name),
        }
    }

    /// Whether no category is set
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether this diff touches `target`
    ///
    /// `NONE` only matches `NONE`, `ALL` matches any non-empty diff, and
    /// anything else matches when at least one of its bits is set.
    #[must_use]
    pub const fn has(self, target: Self) -> bool {
        match target {
            Self::NONE => self.0 == 0,
            Self::ALL => self.0 != 0,
            _ => self.0 & target.0 != 0,
        }
    }

    /// Whether this diff is non-empty and touches nothing outside `target`
    #[must_use]
    pub const fn only(self, target: Self) -> bool {
        self.0 != 0 && self.0 & !target.0 == 0
    }
}

impl BitOr for Diff {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Diff {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.name() {
            return f.write_str(name);
        }
        let names: Vec<&str> = Self::CATEGORIES
            .iter()
            .filter(|(diff, _)| self.has(*diff))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join(", "))
    }
}

impl fmt::Debug for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Diff({self})")
    }
}

impl Serialize for Diff {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Entries recorded per category, for categories where the individual
/// entries matter (Wolfi package and base image names)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedFiles(BTreeMap<Diff, Vec<String>>);

impl ChangedFiles {
    /// Entries recorded for `category`
    #[must_use]
    pub fn get(&self, category: Diff) -> &[String] {
        self.0.get(&category).map_or(&[], Vec::as_slice)
    }

    /// Record an entry for `category`
    pub fn push(&mut self, category: Diff, entry: impl Into<String>) {
        self.0.entry(category).or_default().push(entry.into());
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Classify `files` relative to the current directory
#[must_use]
pub fn parse_diff(files: &[String]) -> (Diff, ChangedFiles) {
    parse_diff_in(Path::new("."), files)
}

/// Classify `files`, reading file contents relative to `root`
#[must_use]
pub fn parse_diff_in(root: &Path, files: &[String]) -> (Diff, ChangedFiles) {
    let mut diff = Diff::NONE;
    let mut changed = ChangedFiles::default();

    for path in files.iter().map(|f| f.trim()).filter(|f| !f.is_empty()) {
        let bits = classify(root, path);
        debug!(path, diff = %bits, "classified changed file");
        diff |= bits;

        if bits.has(Diff::WOLFI_PACKAGES)
            && let Some(name) = yaml_entry(path, "wolfi-packages/")
        {
            changed.push(Diff::WOLFI_PACKAGES, name);
        }
        if bits.has(Diff::WOLFI_BASE_IMAGES)
            && let Some(name) = yaml_entry(path, "wolfi-images/")
        {
            changed.push(Diff::WOLFI_BASE_IMAGES, name);
        }
    }

    (diff, changed)
}

fn classify(root: &Path, p: &str) -> Diff {
    let mut diff = Diff::NONE;

    if p.ends_with(".go") || p == "go.sum" || p == "go.mod" {
        diff |= Diff::GO;
    }
    if p.ends_with("dev/ci/go-test.sh") {
        diff |= Diff::GO;
    }
    if TOP_LEVEL_GO_DIRS
        .iter()
        .any(|dir| p.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/')))
    {
        diff |= Diff::GO;
    }
    // sg configuration drives generated code and checks
    if p == "sg.config.yaml" {
        diff |= Diff::GO;
    }

    if !p.ends_with(".md") && (ROOT_CLIENT_FILES.contains(&p) || p.starts_with("client/")) {
        diff |= Diff::CLIENT;
    }
    if p.ends_with("dev/ci/pnpm-test.sh") {
        diff |= Diff::CLIENT;
    }
    // release tooling is linted like client code, its config file is not
    if p.starts_with("dev/release/") && !p.contains("release-config") {
        diff |= Diff::CLIENT;
    }

    if p.ends_with(".graphql") {
        diff |= Diff::GRAPHQL;
    }

    if p.starts_with("migrations/") {
        diff |= Diff::DATABASE_SCHEMA | Diff::GO;
    }
    if p.starts_with("dev/ci/go-backcompat") {
        diff |= Diff::DATABASE_SCHEMA;
    }

    if p.starts_with("doc/") || p.ends_with(".md") {
        diff |= Diff::DOCS;
    }
    if [".yaml", ".yml", ".json", ".jsonc", ".json5"]
        .iter()
        .any(|ext| p.ends_with(ext))
    {
        diff |= Diff::DOCS;
    }

    if p.starts_with("Dockerfile") || p.ends_with("Dockerfile") {
        diff |= Diff::DOCKERFILES | Diff::DOCKER_IMAGES;
    }
    if p.starts_with("docker-images/") {
        diff |= Diff::DOCKER_IMAGES;
    }
    if p.starts_with("cmd/executor/docker-mirror/") {
        diff |= Diff::EXECUTOR_DOCKER_REGISTRY_MIRROR;
    }
    if p.starts_with("docker-images/executor-vm/") {
        diff |= Diff::EXECUTOR_VM_IMAGE;
    }
    if p.starts_with("enterprise/dev/ci/scripts") {
        diff |= Diff::CI_SCRIPTS;
    }

    if p.ends_with(".tf") {
        diff |= Diff::TERRAFORM;
    }
    if p.ends_with(".svg") {
        diff |= Diff::SVG;
    }
    if p.ends_with(".sh") || has_bash_shebang(&root.join(p)) {
        diff |= Diff::SHELL;
    }

    if yaml_entry(p, "wolfi-packages/").is_some() {
        diff |= Diff::WOLFI_PACKAGES;
    }
    if yaml_entry(p, "wolfi-images/").is_some() {
        diff |= Diff::WOLFI_BASE_IMAGES;
    }

    if p.ends_with(".proto") || p.ends_with("buf.yaml") || p.ends_with("buf.gen.yaml") {
        diff |= Diff::PROTOBUF;
    }
    if p.ends_with(".pb.go") {
        diff |= Diff::PROTOBUF;
    }

    if p == "pnpm-lock.yaml" {
        diff |= Diff::PNPM;
    }

    diff
}

/// `wolfi-packages/foo.yaml` -> `foo`
fn yaml_entry<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    path.strip_prefix(dir)?.strip_suffix(".yaml")
}

/// Files without a `.sh` extension may still be bash scripts. Only `bash`
/// shebangs are recognised; unreadable files are not scripts.
fn has_bash_shebang(path: &Path) -> bool {
    let mut head = Vec::with_capacity(SHEBANG_SNIFF_LEN as usize);
    let Ok(file) = File::open(path) else {
        return false;
    };
    if file.take(SHEBANG_SNIFF_LEN).read_to_end(&mut head).is_err() {
        return false;
    }
    head.starts_with(b"#!") && head.windows(4).any(|w| w == b"bash")
}

/// An `sg lint` target and the categories that make it relevant
struct LinterTarget {
    name: &'static str,
    diff: Diff,
}

const LINTER_TARGETS: &[LinterTarget] = &[
    LinterTarget {
        name: "urls",
        diff: Diff::ALL,
    },
    LinterTarget {
        name: "go",
        diff: Diff(Diff::GO.0 | Diff::GRAPHQL.0),
    },
    LinterTarget {
        name: "docs",
        diff: Diff::DOCS,
    },
    LinterTarget {
        name: "dockerfiles",
        diff: Diff::DOCKERFILES,
    },
    LinterTarget {
        name: "client",
        diff: Diff(Diff::CLIENT.0 | Diff::GRAPHQL.0 | Diff::PNPM.0),
    },
    LinterTarget {
        name: "svg",
        diff: Diff::SVG,
    },
    LinterTarget {
        name: "shell",
        diff: Diff(Diff::SHELL.0 | Diff::CI_SCRIPTS.0),
    },
    LinterTarget {
        name: "protobuf",
        diff: Diff::PROTOBUF,
    },
];

/// `sg lint` targets relevant to `diff`
#[must_use]
pub fn linter_targets(diff: Diff) -> Vec<&'static str> {
    LINTER_TARGETS
        .iter()
        .filter(|target| diff.has(target.diff))
        .map(|target| target.name)
        .collect()
}

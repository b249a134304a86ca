//! Markdown renderings of a generated pipeline and of the run type reference

use crate::changed::Diff;
use crate::config::{Config, PLACEHOLDER_COMMIT};
use crate::error::Result;
use crate::generate::operations_for;
use crate::git::StaticGit;
use crate::runtype::{RUN_TYPES, RunTypeEntry};
use crate::settings::Settings;
use chrono::{DateTime, Utc};
use pipegen_buildkite::{Pipeline, Step};
use std::collections::HashMap;
use std::path::Path;

/// Dependencies listed per step before the rest is summarised
const MAX_LISTED_DEPENDENCIES: usize = 5;
/// Operations listed per run type in the reference
const MAX_LISTED_OPERATIONS: usize = 10;

/// Summary of what was generated for a build, for humans
#[must_use]
pub fn render_preview(config: &Config, pipeline: &Pipeline) -> String {
    let mut md = String::new();
    md.push_str(&format!("- **Detected run type:** {}\n", config.run_type));
    md.push_str(&format!("- **Detected diffs:** {}\n", config.diff));
    md.push_str("- **Computed variables:**\n");
    md.push_str(&format!("  - VERSION={}\n", config.version));
    md.push_str("- **Computed build steps:**\n");
    render_steps(&mut md, &pipeline.steps, 1);
    md
}

fn render_steps(md: &mut String, steps: &[Step], depth: usize) {
    let indent = "  ".repeat(depth);
    for step in steps {
        match step {
            Step::Command(command) => {
                let label = command.label.as_deref().unwrap_or("(unlabelled)");
                md.push_str(&format!("{indent}- {label}"));
                if let Some(key) = &command.key {
                    md.push_str(&format!(" (`{key}`)"));
                }
                if !command.depends_on.is_empty() {
                    md.push_str(&format!(" → depends on {}", dependencies(&command.depends_on)));
                }
                md.push('\n');
            }
            Step::Trigger(trigger) => {
                let label = trigger.label.as_deref().unwrap_or("(unlabelled)");
                md.push_str(&format!("{indent}- {label} → triggers `{}`\n", trigger.trigger));
            }
            Step::Wait(_) => md.push_str(&format!("{indent}- _wait_\n")),
            Step::Group(group) => {
                md.push_str(&format!("{indent}- **{}**\n", group.group));
                render_steps(md, &group.steps, depth + 1);
            }
        }
    }
}

fn dependencies(keys: &[String]) -> String {
    let listed: Vec<String> = keys
        .iter()
        .take(MAX_LISTED_DEPENDENCIES)
        .map(|key| format!("`{key}`"))
        .collect();
    let mut text = listed.join(", ");
    if keys.len() > MAX_LISTED_DEPENDENCIES {
        text.push_str(&format!(" and {} more", keys.len() - MAX_LISTED_DEPENDENCIES));
    }
    text
}

/// A build of `entry` touching everything, as close to a real one as the
/// matcher allows
fn sample_config(entry: &RunTypeEntry, settings: &Settings, repo_root: &Path) -> Result<Config> {
    let matcher = entry.matcher;

    let mut env: HashMap<String, String> = matcher
        .env_includes
        .iter()
        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
        .collect();

    let (branch, tag) = if !matcher.tag_prefix.is_empty() {
        let version = &settings.minimum_upgradeable_version;
        let minor = version.rsplit_once('.').map_or(version.as_str(), |(minor, _)| minor);
        (minor.to_string(), format!("{}{version}", matcher.tag_prefix))
    } else if matcher.branch_regexp {
        ("5.1".to_string(), String::new())
    } else if matcher.branch_exact {
        (matcher.branch.to_string(), String::new())
    } else if !matcher.branch.is_empty() {
        (format!("{}server/example", matcher.branch), String::new())
    } else {
        ("my-feature".to_string(), String::new())
    };

    env.insert("BUILDKITE_BRANCH".to_string(), branch);
    env.insert("BUILDKITE_TAG".to_string(), tag);
    env.insert("BUILDKITE_COMMIT".to_string(), PLACEHOLDER_COMMIT.to_string());
    env.insert(
        "BUILDKITE_MESSAGE".to_string(),
        "Example change\n\n!bazel test //... --runs_per_test=2".to_string(),
    );

    let mut config = Config::compute(
        &env,
        &StaticGit::default(),
        DateTime::<Utc>::default(),
        repo_root,
    )?;
    config.diff = Diff::ALL;
    Ok(config)
}

/// Reference of every run type and diff category
///
/// Each run type is shown with the operations a build touching everything
/// gets, discovered against the checkout at `repo_root`.
#[must_use]
pub fn render_docs(settings: &Settings, repo_root: &Path) -> String {
    let mut md = String::new();
    md.push_str("# Pipeline reference\n\n");
    md.push_str("## Run types\n\n");
    md.push_str("The first matching run type wins, in the order listed.\n\n");

    for entry in RUN_TYPES {
        md.push_str(&format!("### {}\n\n", entry.name));
        md.push_str(&format!("{}.\n\n", entry.matcher.describe()));

        match sample_config(entry, settings, repo_root)
            .and_then(|config| operations_for(&config, settings))
        {
            Ok(ops) => {
                let names = ops.operation_names();
                md.push_str("Operations when everything changed:\n\n");
                for name in names.iter().take(MAX_LISTED_OPERATIONS) {
                    md.push_str(&format!("- {name}\n"));
                }
                if names.len() > MAX_LISTED_OPERATIONS {
                    md.push_str(&format!(
                        "- ... and {} more\n",
                        names.len() - MAX_LISTED_OPERATIONS
                    ));
                }
            }
            Err(err) => md.push_str(&format!("Operations unavailable here: {err}\n")),
        }
        md.push('\n');
    }

    md.push_str("## Diff categories\n\n");
    for category in Diff::categories() {
        md.push_str(&format!("- {category}\n"));
    }
    md
}

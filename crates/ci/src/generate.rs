//! Pipeline assembly
//!
//! [`operations_for`] decides which operations a build gets from its run type
//! and diff; [`generate_pipeline`] applies them to a builder carrying the
//! pipeline-wide environment and step defaults.

use crate::bazel::BazelCommand;
use crate::changed::{Diff, linter_targets};
use crate::config::Config;
use crate::error::Result;
use crate::git::Git;
use crate::images::{ensure_known_image, sourcegraph_docker_images};
use crate::operations::{PIPELINE_SETUP_SET_NAME, Set};
use crate::runtype::RunType;
use crate::settings::Settings;
use crate::steps::backend::{GoBackcompatTests, GoBuild, GoTests};
use crate::steps::client::{
    AppRelease, BrowserExtensionE2e, BrowserExtensionIntegrationTests, BrowserExtensionRelease,
    BrowserExtensionUnitTests, ChromaticTests, ClientIntegrationTests, FrontendTests,
    JetBrainsUnitTests, PrPreview, TypescriptCheck, VsceIntegrationTests, VsceRelease, WebApp,
};
use crate::steps::docker::{CandidateImage, PublishFinalImage, TrivyScan};
use crate::steps::executors::{BuildExecutorImage, ExecutorImage, PublishExecutorImage};
use crate::steps::integration::{
    BackendIntegrationTests, ClusterQa, CodeIntelQa, ServerE2e, ServerQa, UpgradeTest,
};
use crate::steps::lint::{CiScriptTests, ClientLinters, GraphQlLint, SgLint};
use crate::steps::misc::{
    PipelineMetadata, ReleaseBranchHealthchecks, TriggerAsync, UploadBuildTrace, Wait,
};
use crate::steps::wolfi::{
    AllBaseImagesBuilt, WolfiBaseImage, WolfiPackage, WolfiRepoIndex, discover_base_images,
};
use pipegen_buildkite::{BuildOptions, Pipeline, PipelineBuilder, StepDefault};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// Knobs of [`core_test_operations`] that depend on the run type
#[derive(Debug, Clone, Default)]
pub struct CoreTestOptions {
    /// Accept Chromatic changes without review
    pub chromatic_should_auto_accept: bool,
    /// Oldest version the database schema must stay compatible with
    pub minimum_upgradeable_version: String,
    /// Lint only the files changed by the pull request
    pub client_lint_only_changed_files: bool,
    /// Run review-gated steps on draft pull requests too
    pub force_ready_for_review: bool,
    /// How often this job was retried
    pub retry_count: u32,
    /// Checkout the tests are discovered in
    pub repo_root: PathBuf,
}

impl CoreTestOptions {
    /// Options shared by every run type: nothing forced, nothing accepted
    #[must_use]
    pub fn new(config: &Config, settings: &Settings) -> Self {
        Self {
            minimum_upgradeable_version: settings.minimum_upgradeable_version.clone(),
            retry_count: config.retry_count,
            repo_root: config.repo_root.clone(),
            ..Self::default()
        }
    }
}

/// Tests shared by pull requests and every run type that tests before
/// publishing, selected by `diff`
///
/// Add an operation here when its condition can be expressed with the diff
/// and [`CoreTestOptions`]; anything else belongs in [`operations_for`].
pub fn core_test_operations(diff: Diff, opts: &CoreTestOptions) -> Result<Set> {
    let mut ops = Set::new();

    let mut linters = Set::named("Linters and static analysis");
    if diff.has(Diff::GRAPHQL) {
        linters.append(GraphQlLint);
    }
    let targets = linter_targets(diff);
    if !targets.is_empty() {
        linters.append(SgLint::new(targets, opts.retry_count));
    }
    ops.merge(linters);

    // GraphQL changes affect both the client and the backend.
    if diff.has(Diff::CLIENT | Diff::GRAPHQL) {
        ops.merge(
            Set::named("Client checks")
                .with(ClientIntegrationTests::discover(&opts.repo_root))
                .with(ChromaticTests {
                    auto_accept: opts.chromatic_should_auto_accept,
                    force_ready_for_review: opts.force_ready_for_review,
                })
                .with(FrontendTests)
                .with(WebApp)
                .with(BrowserExtensionUnitTests)
                .with(JetBrainsUnitTests)
                .with(TypescriptCheck)
                .with(ClientLinters {
                    changed_only: opts.client_lint_only_changed_files,
                }),
        );
    }

    if diff.has(Diff::GO | Diff::GRAPHQL) {
        ops.merge(Set::named("Go checks").with(GoTests).with(GoBuild));
    }

    // The last minor release must keep passing its tests on the new schema,
    // so the schema can be rolled forward before an upgrade.
    if diff.has(Diff::DATABASE_SCHEMA) {
        ops.merge(Set::named("DB backcompat tests").with(GoBackcompatTests {
            minimum_upgradeable_version: opts.minimum_upgradeable_version.clone(),
        }));
    }

    if diff.has(Diff::CI_SCRIPTS) {
        ops.merge(Set::named("CI script tests").with(CiScriptTests::discover(&opts.repo_root)?));
    }

    Ok(ops)
}

/// Environment set on the whole pipeline
#[must_use]
pub fn pipeline_env(config: &Config) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = [
        ("CI", "true"),
        ("GO111MODULE", "on"),
        ("FORCE_COLOR", "3"),
        ("ENTERPRISE", "1"),
        ("NODE_OPTIONS", "--max_old_space_size=8192"),
        ("CI_REPO_OWNER", "sourcegraph"),
        ("CI_REPO_NAME", "sourcegraph"),
        ("CI_BUILDEVENT_DATASET", "buildkite"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    env.insert("BUILDKITE_PULL_REQUEST_REPO".to_string(), config.pull_request_repo.clone());
    env.insert("COMMIT_SHA".to_string(), config.commit.clone());
    env.insert("DATE".to_string(), config.time.to_rfc3339());
    env.insert("VERSION".to_string(), config.version.clone());
    env.insert(
        "CI_DEBUG_PROFILE".to_string(),
        config.message_flags.profiling_enabled.to_string(),
    );
    env.insert("CI_COMMIT_SHA".to_string(), config.commit.clone());
    // Buildkite interpolates `$` in uploaded pipelines.
    env.insert("CI_COMMIT_MESSAGE".to_string(), config.message.replace('$', "$$"));

    if config
        .run_type
        .is(&[RunType::ReleaseBranch, RunType::TaggedRelease])
    {
        env.insert("PERCY_TARGET_BRANCH".to_string(), config.branch.clone());
        env.insert("SERVICE_WORKER_CACHE".to_string(), "false".to_string());
    }
    env
}

fn build_options(config: &Config) -> BuildOptions {
    BuildOptions {
        message: config.message.clone(),
        commit: config.commit.clone(),
        branch: config.branch.clone(),
        env: pipeline_env(config),
    }
}

fn pipeline_setup(config: &Config, settings: &Settings) -> Set {
    Set::named(PIPELINE_SETUP_SET_NAME).with(TriggerAsync::new(
        &settings.async_pipeline,
        build_options(config),
    ))
}

/// Package builds and base image rebuilds for changed Wolfi definitions
fn wolfi_operations(config: &Config, settings: &Settings) -> Vec<Set> {
    let mut sets = Vec::new();
    let packages = config.changed_files.get(Diff::WOLFI_PACKAGES);
    let packages_changed = config.diff.has(Diff::WOLFI_PACKAGES) && !packages.is_empty();

    if packages_changed {
        let mut set = Set::named("Dependency packages");
        for package in packages {
            set.append(WolfiPackage::new(package, &settings.queues.bazel));
        }
        set.append(WolfiRepoIndex::new(packages));
        sets.push(set);
    }

    let images = config.changed_files.get(Diff::WOLFI_BASE_IMAGES);
    if config.diff.has(Diff::WOLFI_BASE_IMAGES) && !images.is_empty() {
        sets.push(base_image_builds(
            images,
            config,
            settings,
            packages_changed,
        ));
    }
    sets
}

fn base_image_builds(
    images: &[String],
    config: &Config,
    settings: &Settings,
    after_packages: bool,
) -> Set {
    let tag = config.candidate_image_tag();
    let mut set = Set::named("Base image builds");
    for image in images {
        set.append(WolfiBaseImage::new(
            image,
            &tag,
            &settings.queues.bazel,
            after_packages,
        ));
    }
    set.append(AllBaseImagesBuilt::new(images));
    set
}

/// The operations a build gets, in order
///
/// Everything that inspects the checkout happens here, so the returned set
/// applies without errors.
pub fn operations_for(config: &Config, settings: &Settings) -> Result<Set> {
    let mut ops = Set::new();
    ops.append(PipelineMetadata::new(config)?);

    let run_type = config.run_type;
    let candidate_tag = config.candidate_image_tag();
    let registries = &settings.registries;
    let flags = config.message_flags;

    match run_type {
        RunType::BazelDo => {
            ops.append(BazelCommand::from_message(
                &config.message,
                &settings.queues.bazel,
            )?);
        }

        RunType::WolfiBaseRebuild => {
            let images = discover_base_images(&config.repo_root);
            ops.merge(base_image_builds(&images, config, settings, false));
        }

        RunType::PullRequest | RunType::ManuallyTriggered => {
            for set in wolfi_operations(config, settings) {
                ops.merge(set);
            }

            ops.merge(core_test_operations(
                config.diff,
                &CoreTestOptions {
                    client_lint_only_changed_files: run_type == RunType::PullRequest,
                    force_ready_for_review: flags.force_ready_for_review,
                    ..CoreTestOptions::new(config, settings)
                },
            )?);

            // Only the web app has slow tests in the async pipeline.
            if config.diff.has(Diff::CLIENT) {
                ops.merge(pipeline_setup(config, settings));
                ops.append(PrPreview);
            }
        }

        RunType::ReleaseNightly => {
            ops.append(ReleaseBranchHealthchecks::new(
                &settings.healthcheck_pipeline,
                &settings.minimum_upgradeable_version,
                config.time,
            )?);
        }

        RunType::BextReleaseBranch => {
            ops.append(ClientLinters {
                changed_only: false,
            })
            .append(BrowserExtensionUnitTests)
            // no web chunks share the Percy build here
            .append(BrowserExtensionIntegrationTests { web_chunks: 0 })
            .append(FrontendTests)
            .append(Wait)
            .append(BrowserExtensionRelease);
        }

        RunType::BextNightly | RunType::BextManualNightly => {
            ops.append(ClientLinters {
                changed_only: false,
            })
            .append(BrowserExtensionUnitTests)
            .append(BrowserExtensionIntegrationTests { web_chunks: 0 })
            .append(FrontendTests)
            .append(Wait)
            .append(BrowserExtensionE2e);
        }

        RunType::VsceReleaseBranch => {
            ops.append(VsceIntegrationTests)
                .append(Wait)
                .append(VsceRelease);
        }

        RunType::AppRelease | RunType::AppInsiders => {
            ops.append(AppRelease::new(
                config.time,
                config.build_number,
                &config.commit,
                run_type == RunType::AppInsiders,
            ));
        }

        RunType::ImagePatch => {
            let app = run_type.matcher().extract_branch_argument(&config.branch)?;
            ensure_known_image(&app)?;

            ops.append(CandidateImage::new(&app, config, registries, false))
                .append(TrivyScan::new(&app, &candidate_tag, registries));
            ops.merge(core_test_operations(
                Diff::ALL,
                &CoreTestOptions::new(config, settings),
            )?);
            ops.append(Wait)
                .append(PublishFinalImage::new(&app, config, registries));
        }

        RunType::ImagePatchNoTest => {
            let app = run_type.matcher().extract_branch_argument(&config.branch)?;
            ensure_known_image(&app)?;

            ops.append(CandidateImage::new(&app, config, registries, false))
                .append(Wait)
                .append(PublishFinalImage::new(&app, config, registries));
        }

        RunType::CandidatesNoTest => {
            for app in sourcegraph_docker_images() {
                ops.append(CandidateImage::new(app, config, registries, false));
            }
        }

        RunType::ExecutorPatchNoTest => {
            ops.append(BuildExecutorImage::new(ExecutorImage::Vm, config, true)?)
                .append(BuildExecutorImage::new(
                    ExecutorImage::DockerMirror,
                    config,
                    true,
                )?)
                .append(Wait)
                .append(PublishExecutorImage::new(ExecutorImage::Vm, config, true)?)
                .append(PublishExecutorImage::new(
                    ExecutorImage::DockerMirror,
                    config,
                    true,
                )?);
        }

        RunType::BackendIntegrationTests => {
            ops.append(CandidateImage::new("server", config, registries, false))
                .append(BackendIntegrationTests::new(&candidate_tag, registries));
        }

        RunType::MainBranch | RunType::MainDryRun | RunType::ReleaseBranch | RunType::TaggedRelease => {
            let release = run_type.is(&[RunType::ReleaseBranch, RunType::TaggedRelease]);
            let skip_hash_compare = flags.skip_hash_compare || release;
            let docker_mirror =
                release || config.diff.has(Diff::EXECUTOR_DOCKER_REGISTRY_MIRROR);

            ops.merge(pipeline_setup(config, settings));

            let mut builds = Set::named("Image builds");
            for app in sourcegraph_docker_images() {
                // Source maps are only uploaded from main.
                let upload_sourcemaps = run_type == RunType::MainBranch && app == "frontend";
                builds.append(CandidateImage::new(app, config, registries, upload_sourcemaps));
            }
            builds.append(BuildExecutorImage::new(
                ExecutorImage::Vm,
                config,
                skip_hash_compare,
            )?);
            if docker_mirror {
                builds.append(BuildExecutorImage::new(
                    ExecutorImage::DockerMirror,
                    config,
                    skip_hash_compare,
                )?);
            }
            ops.merge(builds);

            let mut scans = Set::named("Image security scans");
            for app in sourcegraph_docker_images() {
                scans.append(TrivyScan::new(app, &candidate_tag, registries));
            }
            ops.merge(scans);

            ops.merge(core_test_operations(
                Diff::ALL,
                &CoreTestOptions {
                    chromatic_should_auto_accept: run_type.is(&[
                        RunType::MainBranch,
                        RunType::ReleaseBranch,
                        RunType::TaggedRelease,
                    ]),
                    force_ready_for_review: flags.force_ready_for_review,
                    ..CoreTestOptions::new(config, settings)
                },
            )?);

            ops.merge(
                Set::named("Integration tests")
                    .with(BackendIntegrationTests::new(&candidate_tag, registries))
                    .with(CodeIntelQa {
                        candidate_tag: candidate_tag.clone(),
                    }),
            );
            let mut e2e = Set::named("End-to-end tests")
                .with(ServerE2e {
                    candidate_tag: candidate_tag.clone(),
                })
                .with(ServerQa {
                    candidate_tag: candidate_tag.clone(),
                })
                .with(ClusterQa {
                    candidate_tag: candidate_tag.clone(),
                });
            // Release branches must upgrade cleanly from the oldest supported release.
            if run_type == RunType::ReleaseBranch {
                e2e.append(UpgradeTest {
                    candidate_tag: candidate_tag.clone(),
                    minimum_upgradeable_version: settings.minimum_upgradeable_version.clone(),
                });
            }
            ops.merge(e2e);

            ops.append(Wait);

            let mut publish = Set::named("Publish images");
            for app in sourcegraph_docker_images() {
                publish.append(PublishFinalImage::new(app, config, registries));
            }
            if run_type.is(&[RunType::MainBranch, RunType::TaggedRelease]) {
                publish.append(PublishExecutorImage::new(
                    ExecutorImage::Vm,
                    config,
                    skip_hash_compare,
                )?);
                if docker_mirror {
                    publish.append(PublishExecutorImage::new(
                        ExecutorImage::DockerMirror,
                        config,
                        skip_hash_compare,
                    )?);
                }
            }
            ops.merge(publish);
        }
    }

    ops.append(Wait).append(UploadBuildTrace);
    debug!(operations = ops.len(), run_type = %run_type, "selected operations");
    Ok(ops)
}

/// Generate the pipeline of a build
pub fn generate_pipeline(config: &Config, settings: &Settings, git: &dyn Git) -> Result<Pipeline> {
    config.ensure_commit(git)?;

    let ops = operations_for(config, settings)?;

    let mut builder = PipelineBuilder::new(settings.cache.clone())
        .with_default(StepDefault::Timeout(settings.default_timeout_minutes))
        .with_default(StepDefault::queue(&settings.queues.stateless))
        .with_default(StepDefault::AgentLostRetry);
    if config.message_flags.profiling_enabled {
        builder = builder.with_default(StepDefault::Profiling);
    }
    for (key, value) in pipeline_env(config) {
        builder = builder.with_env(key, value);
    }

    ops.apply(&mut builder);
    let pipeline = builder.build()?;
    info!(
        run_type = %config.run_type,
        steps = pipeline.steps.len(),
        "generated pipeline"
    );
    Ok(pipeline)
}

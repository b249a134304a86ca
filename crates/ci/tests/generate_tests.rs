//! End-to-end pipeline generation against a scratch checkout.

use chrono::{TimeZone, Utc};
use pipegen_buildkite::{Step, to_json, to_yaml};
use pipegen_ci::steps::lint::CI_SCRIPT_TESTS_DIR;
use pipegen_ci::{Config, Error, RunType, Settings, StaticGit, generate_pipeline, render_preview};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn checkout() -> TempDir {
    let dir = TempDir::new().unwrap();
    let tests = dir.path().join(CI_SCRIPT_TESTS_DIR);
    fs::create_dir_all(&tests).unwrap();
    fs::write(tests.join("lint-scripts.sh"), "#!/usr/bin/env bash\n").unwrap();
    fs::create_dir_all(dir.path().join("wolfi-images")).unwrap();
    fs::write(dir.path().join("wolfi-images/gitserver.yaml"), "").unwrap();
    dir
}

fn compute(root: &Path, vars: &[(&str, &str)], changed: &[&str]) -> Config {
    let env: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    let now = Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap();
    Config::compute(&env, &StaticGit::new(changed.iter().copied()), now, root).unwrap()
}

fn keys(pipeline: &pipegen_buildkite::Pipeline) -> Vec<String> {
    pipeline
        .walk()
        .filter_map(|step| match step {
            Step::Command(command) => command.key.clone(),
            Step::Trigger(trigger) => trigger.key.clone(),
            Step::Group(group) => group.key.clone(),
            Step::Wait(_) => None,
        })
        .collect()
}

#[test]
fn test_main_branch_pipeline() {
    let dir = checkout();
    let config = compute(
        dir.path(),
        &[
            ("BUILDKITE_BRANCH", "main"),
            ("BUILDKITE_COMMIT", "0123456789abcdef"),
            ("BUILDKITE_BUILD_NUMBER", "42"),
        ],
        &["internal/foo.go"],
    );
    assert_eq!(config.run_type, RunType::MainBranch);

    let pipeline = generate_pipeline(&config, &Settings::default(), &StaticGit::default()).unwrap();

    let keys = keys(&pipeline);
    let unique: HashSet<&String> = keys.iter().collect();
    assert_eq!(keys.len(), unique.len());

    let server = pipeline.find_step("server:candidate").unwrap();
    assert_eq!(server.agents["queue"], "stateless");
    assert!(pipeline.find_step("executor-vm-image:candidate").is_some());

    let json: serde_json::Value = serde_json::from_str(&to_json(&pipeline).unwrap()).unwrap();
    assert_eq!(json["env"]["VERSION"], config.version.as_str());
    assert!(json["steps"].as_array().is_some_and(|steps| !steps.is_empty()));

    let preview = render_preview(&config, &pipeline);
    assert!(preview.contains("- **Detected run type:** Main branch\n"));
}

#[test]
fn test_tagged_release_pipeline() {
    let dir = checkout();
    let config = compute(
        dir.path(),
        &[
            ("BUILDKITE_BRANCH", "5.2"),
            ("BUILDKITE_TAG", "v5.2.1"),
            ("BUILDKITE_COMMIT", "0123456789abcdef"),
        ],
        &[],
    );
    assert_eq!(config.run_type, RunType::TaggedRelease);
    assert_eq!(config.version, "5.2.1");

    let pipeline = generate_pipeline(&config, &Settings::default(), &StaticGit::default()).unwrap();
    // releases always rebuild the registry mirror
    assert!(
        pipeline
            .find_step("executor-docker-mirror-vm-image:candidate")
            .is_some()
    );
    assert!(pipeline.command_steps().any(|step| {
        step.env
            .values()
            .any(|value| value == "sourcegraph-executors-5-2")
    }));
}

#[test]
fn test_bazel_do_runs_directive() {
    let dir = checkout();
    let config = compute(
        dir.path(),
        &[
            ("BUILDKITE_BRANCH", "bazel-do/flaky"),
            ("BUILDKITE_COMMIT", "0123456789abcdef"),
            (
                "BUILDKITE_MESSAGE",
                "Chase a flake\n\n!bazel test //foo/... --runs_per_test=10",
            ),
        ],
        &[],
    );
    assert_eq!(config.run_type, RunType::BazelDo);

    let pipeline = generate_pipeline(&config, &Settings::default(), &StaticGit::default()).unwrap();
    let bazel: Vec<_> = pipeline
        .command_steps()
        .filter(|step| step.key.as_deref() == Some("bazel-do"))
        .collect();
    assert_eq!(bazel.len(), 1);
    assert_eq!(bazel[0].agents["queue"], "bazel");
    assert!(bazel[0].command[0].ends_with("test //foo/... --runs_per_test=10"));
}

#[test]
fn test_bazel_do_rejects_run() {
    let dir = checkout();
    let config = compute(
        dir.path(),
        &[
            ("BUILDKITE_BRANCH", "bazel-do/flaky"),
            ("BUILDKITE_COMMIT", "0123456789abcdef"),
            ("BUILDKITE_MESSAGE", "!bazel run //foo"),
        ],
        &[],
    );
    let err = generate_pipeline(&config, &Settings::default(), &StaticGit::default()).unwrap_err();
    assert!(matches!(err, Error::BazelCommand { .. }));
}

#[test]
fn test_pull_request_yaml() {
    let dir = checkout();
    let config = compute(
        dir.path(),
        &[
            ("BUILDKITE_BRANCH", "my-feature"),
            ("BUILDKITE_COMMIT", "0123456789abcdef"),
        ],
        &["doc/admin/index.md"],
    );
    assert_eq!(config.run_type, RunType::PullRequest);

    let pipeline = generate_pipeline(&config, &Settings::default(), &StaticGit::default()).unwrap();
    let yaml = to_yaml(&pipeline).unwrap();
    let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(parsed["env"]["CI"].as_str(), Some("true"));
    assert_eq!(parsed["env"]["VERSION"].as_str(), Some(config.version.as_str()));
    // docs only: no image builds
    assert!(pipeline.find_step("server:candidate").is_none());
}

fn labels(pipeline: &pipegen_buildkite::Pipeline) -> Vec<String> {
    pipeline
        .walk()
        .filter_map(|step| match step {
            Step::Command(command) => command.label.clone(),
            Step::Trigger(trigger) => trigger.label.clone(),
            Step::Group(_) | Step::Wait(_) => None,
        })
        .collect()
}

struct Case {
    run_type: RunType,
    branch: &'static str,
    tag: &'static str,
    env: &'static [(&'static str, &'static str)],
    message: &'static str,
    keys: &'static [&'static str],
    labels: &'static [&'static str],
}

const CASES: &[Case] = &[
    Case {
        run_type: RunType::PullRequest,
        branch: "my-feature",
        tag: "",
        env: &[],
        message: "",
        keys: &[],
        labels: &[":go: Test ("],
    },
    Case {
        run_type: RunType::ManuallyTriggered,
        branch: "_manually_triggered_external/fork",
        tag: "",
        env: &[],
        message: "",
        keys: &[],
        labels: &[":go: Test ("],
    },
    Case {
        run_type: RunType::ReleaseNightly,
        branch: "main",
        tag: "",
        env: &[("RELEASE_NIGHTLY", "true")],
        message: "",
        keys: &[],
        labels: &[":stethoscope: Trigger 5.0 release branch healthcheck build"],
    },
    Case {
        run_type: RunType::BextNightly,
        branch: "main",
        tag: "",
        env: &[("BEXT_NIGHTLY", "true")],
        message: "",
        keys: &[],
        labels: &["E2E for chrome extension"],
    },
    Case {
        run_type: RunType::BextManualNightly,
        branch: "bext/nightly/try",
        tag: "",
        env: &[],
        message: "",
        keys: &[],
        labels: &["E2E for chrome extension"],
    },
    Case {
        run_type: RunType::AppRelease,
        branch: "app/release",
        tag: "",
        env: &[],
        message: "",
        keys: &[],
        labels: &[":desktop_computer: App release"],
    },
    Case {
        run_type: RunType::AppInsiders,
        branch: "app/insiders",
        tag: "",
        env: &[],
        message: "",
        keys: &[],
        labels: &[":desktop_computer: App release"],
    },
    Case {
        run_type: RunType::WolfiBaseRebuild,
        branch: "main",
        tag: "",
        env: &[("WOLFI_BASE_REBUILD", "true")],
        message: "",
        keys: &["build-base-image-gitserver", "buildAllBaseImages"],
        labels: &[],
    },
    Case {
        run_type: RunType::TaggedRelease,
        branch: "5.2",
        tag: "v5.2.1",
        env: &[],
        message: "",
        keys: &["server:candidate", "executor-docker-mirror-vm-image:candidate"],
        labels: &[":packer: :white_check_mark: Publish"],
    },
    Case {
        run_type: RunType::ReleaseBranch,
        branch: "5.2",
        tag: "",
        env: &[],
        message: "",
        keys: &["server:candidate"],
        labels: &[":docker::arrow_double_up: Sourcegraph Upgrade"],
    },
    Case {
        run_type: RunType::BextReleaseBranch,
        branch: "bext/release",
        tag: "",
        env: &[],
        message: "",
        keys: &[],
        labels: &[":rocket::chrome: Extension release"],
    },
    Case {
        run_type: RunType::VsceReleaseBranch,
        branch: "vsce/release",
        tag: "",
        env: &[],
        message: "",
        keys: &[],
        labels: &[":vscode: Extension release"],
    },
    Case {
        run_type: RunType::MainBranch,
        branch: "main",
        tag: "",
        env: &[],
        message: "",
        keys: &["server:candidate", "executor-vm-image:candidate"],
        labels: &[":packer: :white_check_mark: Publish"],
    },
    Case {
        run_type: RunType::MainDryRun,
        branch: "main-dry-run/try",
        tag: "",
        env: &[],
        message: "",
        keys: &["server:candidate", "executor-vm-image:candidate"],
        labels: &[":docker: :truck: server"],
    },
    Case {
        run_type: RunType::ImagePatch,
        branch: "docker-images-patch/gitserver/fix",
        tag: "",
        env: &[],
        message: "",
        keys: &["gitserver:candidate"],
        labels: &[":docker: :truck: gitserver", ":go: Test ("],
    },
    Case {
        run_type: RunType::ImagePatchNoTest,
        branch: "docker-images-patch-notest/gitserver/fix",
        tag: "",
        env: &[],
        message: "",
        keys: &["gitserver:candidate"],
        labels: &[":docker: :truck: gitserver"],
    },
    Case {
        run_type: RunType::ExecutorPatchNoTest,
        branch: "executor-patch-notest/try",
        tag: "",
        env: &[],
        message: "",
        keys: &["executor-vm-image:candidate", "executor-docker-mirror-vm-image:candidate"],
        labels: &[":packer: :white_check_mark: Publish"],
    },
    Case {
        run_type: RunType::CandidatesNoTest,
        branch: "docker-images-candidates-notest/try",
        tag: "",
        env: &[],
        message: "",
        keys: &["server:candidate", "frontend:candidate"],
        labels: &[],
    },
    Case {
        run_type: RunType::BackendIntegrationTests,
        branch: "backend-integration/try",
        tag: "",
        env: &[],
        message: "",
        keys: &["server:candidate"],
        labels: &[":chains: Backend integration tests"],
    },
    Case {
        run_type: RunType::BazelDo,
        branch: "bazel-do/try",
        tag: "",
        env: &[],
        message: "!bazel test //foo/...",
        keys: &["bazel-do"],
        labels: &[],
    },
];

fn generate_case(root: &Path, case: &Case) -> (Config, pipegen_buildkite::Pipeline) {
    let mut vars = vec![
        ("BUILDKITE_BRANCH", case.branch),
        ("BUILDKITE_TAG", case.tag),
        ("BUILDKITE_COMMIT", "0123456789abcdef"),
        ("BUILDKITE_BUILD_NUMBER", "42"),
        ("BUILDKITE_MESSAGE", case.message),
    ];
    vars.extend_from_slice(case.env);
    let config = compute(root, &vars, &["internal/foo.go"]);
    let pipeline = generate_pipeline(&config, &Settings::default(), &StaticGit::default())
        .unwrap_or_else(|err| panic!("{:?}: {err}", case.run_type));
    (config, pipeline)
}

#[test]
fn test_every_run_type_generates() {
    let dir = checkout();
    let covered: HashSet<RunType> = CASES.iter().map(|case| case.run_type).collect();
    assert_eq!(covered.len(), RunType::all().count());

    for case in CASES {
        let (config, pipeline) = generate_case(dir.path(), case);
        assert_eq!(config.run_type, case.run_type, "branch {}", case.branch);

        let keys = keys(&pipeline);
        for key in case.keys {
            assert!(keys.iter().any(|k| k == key), "{:?} lacks step {key}", case.run_type);
        }
        let labels = labels(&pipeline);
        for label in case.labels {
            assert!(
                labels.iter().any(|l| l.contains(label)),
                "{:?} lacks step {label}",
                case.run_type
            );
        }
        // every build ends by uploading its trace
        assert!(
            labels.iter().any(|l| l.ends_with("Upload build trace")),
            "{:?}",
            case.run_type
        );
    }
}

#[test]
fn test_no_test_run_types_skip_tests() {
    let dir = checkout();
    for case in CASES.iter().filter(|case| {
        case.run_type.is(&[
            RunType::ImagePatchNoTest,
            RunType::ExecutorPatchNoTest,
            RunType::CandidatesNoTest,
        ])
    }) {
        let (_, pipeline) = generate_case(dir.path(), case);
        let labels = labels(&pipeline);
        assert!(
            !labels.iter().any(|l| l.to_lowercase().contains("test")),
            "{:?} runs tests: {labels:?}",
            case.run_type
        );
    }
}

#[test]
fn test_only_main_and_tags_publish_executors() {
    let dir = checkout();
    for case in CASES.iter().filter(|case| {
        case.run_type.is(&[RunType::MainDryRun, RunType::ReleaseBranch])
    }) {
        let (_, pipeline) = generate_case(dir.path(), case);
        assert!(
            !labels(&pipeline)
                .iter()
                .any(|l| l.starts_with(":packer: :white_check_mark: Publish")),
            "{:?}",
            case.run_type
        );
    }
}

#[test]
fn test_app_insiders_version() {
    let dir = checkout();
    for case in CASES.iter().filter(|case| {
        case.run_type.is(&[RunType::AppRelease, RunType::AppInsiders])
    }) {
        let (_, pipeline) = generate_case(dir.path(), case);
        let release = pipeline
            .command_steps()
            .find(|step| step.label.as_deref() == Some(":desktop_computer: App release"))
            .unwrap();
        assert_eq!(
            release.env["VERSION"],
            if case.run_type == RunType::AppInsiders {
                "2023.06.01-insiders+42.012345"
            } else {
                "2023.06.01+42.012345"
            }
        );
    }
}

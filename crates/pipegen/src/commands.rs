//! Subcommand implementations
//!
//! Each command returns the text to print on stdout; `main` does the printing.

use crate::cli::{CliError, Commands, PipelineFormat};
use pipegen_ci::runtype::RunType;
use pipegen_ci::{
    Config, Git, GitCli, Settings, StaticGit, branch_for_run_type, generate_pipeline,
    render_docs, render_preview,
};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Everything a command needs besides its own arguments
#[derive(Debug, Clone)]
pub struct Context {
    /// Checkout the build runs in
    pub repo: PathBuf,
    /// Optional settings file
    pub settings: Option<PathBuf>,
    /// The build environment
    pub env: HashMap<String, String>,
}

impl Context {
    /// Context of the running process
    #[must_use]
    pub fn from_process(repo: PathBuf, settings: Option<PathBuf>) -> Self {
        Self {
            repo,
            settings,
            env: std::env::vars().collect(),
        }
    }

    fn settings(&self) -> Result<Settings, CliError> {
        Ok(Settings::load_optional(self.settings.as_deref())?)
    }
}

/// Run `command`, returning its output
pub fn execute(command: &Commands, ctx: &Context) -> Result<String, CliError> {
    match command {
        Commands::Generate {
            format,
            preview,
            changed_files,
        } => generate(ctx, *format, *preview, changed_files.as_deref()),
        Commands::Docs => Ok(render_docs(&ctx.settings()?, &ctx.repo)),
        Commands::Runtype { branch, tag } => Ok(runtype(branch, tag, &ctx.env)),
        Commands::Branch {
            run_type,
            argument,
            current,
        } => branch(run_type, argument.as_deref(), current),
    }
}

/// Write a command's output and flush it
///
/// A pipeline that did not fully reach the agent must not exit successfully.
pub fn write_output(out: &mut impl Write, output: &str) -> Result<(), CliError> {
    out.write_all(output.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn read_changed_files(path: &Path) -> Result<StaticGit, CliError> {
    let text = fs::read_to_string(path).map_err(|err| {
        CliError::config_with_help(
            format!("cannot read {}: {err}", path.display()),
            "Pass a file listing one changed path per line",
        )
    })?;
    let files: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    debug!(path = %path.display(), files = files.len(), "read changed files");
    Ok(StaticGit::new(files))
}

fn generate(
    ctx: &Context,
    format: PipelineFormat,
    preview: bool,
    changed_files: Option<&Path>,
) -> Result<String, CliError> {
    let settings = ctx.settings()?;
    let git: Box<dyn Git> = match changed_files {
        Some(path) => Box::new(read_changed_files(path)?),
        None => Box::new(GitCli::new(&ctx.repo)),
    };

    let config = Config::compute(&ctx.env, git.as_ref(), chrono::Utc::now(), &ctx.repo)?;
    let pipeline = generate_pipeline(&config, &settings, git.as_ref())?;

    if preview {
        return Ok(render_preview(&config, &pipeline));
    }
    let out = match format {
        PipelineFormat::Json => pipegen_buildkite::to_json(&pipeline)?,
        PipelineFormat::Yaml => pipegen_buildkite::to_yaml(&pipeline)?,
    };
    info!(run_type = %config.run_type, bytes = out.len(), "pipeline ready for upload");
    Ok(out)
}

fn runtype(branch: &str, tag: &str, env: &HashMap<String, String>) -> String {
    let run_type = RunType::compute(tag, branch, env);
    format!("{run_type}\n")
}

fn branch(run_type: &str, argument: Option<&str>, current: &str) -> Result<String, CliError> {
    let (kind, branch) = branch_for_run_type(run_type, current, argument)?;
    debug!(run_type = %kind, %branch, "computed branch");
    Ok(format!("{branch}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::exit_code_for;
    use tempfile::TempDir;

    fn context(dir: &Path, env: &[(&str, &str)]) -> Context {
        Context {
            repo: dir.to_path_buf(),
            settings: None,
            env: env
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }
    }

    #[test]
    fn test_write_output() {
        let mut out = Vec::new();
        write_output(&mut out, "steps: []\n").unwrap();
        assert_eq!(out, b"steps: []\n");

        let err = write_output(&mut BrokenPipe, "steps: []\n").unwrap_err();
        assert!(matches!(err, CliError::Other { .. }));
        assert_eq!(exit_code_for(&err), crate::cli::EXIT_EVAL);
    }

    #[test]
    fn test_runtype() {
        let env = HashMap::new();
        assert_eq!(runtype("main", "", &env), "Main branch\n");
        assert_eq!(runtype("5.1", "v5.1.2", &env), "Tagged release\n");
        assert_eq!(runtype("my-feature", "", &env), "Pull request\n");
    }

    #[test]
    fn test_branch() {
        assert_eq!(
            branch("main-dry-run", None, "my-feature").unwrap(),
            "main-dry-run/my-feature\n"
        );
        assert_eq!(
            branch("docker-images-patch", Some("gitserver"), "fix").unwrap(),
            "docker-images-patch/gitserver/fix\n"
        );
        let err = branch("docker-images-patch", None, "fix").unwrap_err();
        assert_eq!(exit_code_for(&err), crate::cli::EXIT_CLI);
    }

    #[test]
    fn test_generate_from_changed_files() {
        let dir = TempDir::new().unwrap();
        let files = dir.path().join("changed.txt");
        fs::write(&files, "doc/index.md\n\n").unwrap();

        let ctx = context(
            dir.path(),
            &[("BUILDKITE_BRANCH", "docs"), ("BUILDKITE_COMMIT", "abc")],
        );
        let out = generate(&ctx, PipelineFormat::Yaml, false, Some(&files)).unwrap();
        assert!(out.contains("steps:"));

        let preview = generate(&ctx, PipelineFormat::Json, true, Some(&files)).unwrap();
        assert!(preview.contains("- **Detected diffs:** Docs\n"));
    }

    #[test]
    fn test_generate_missing_changed_files() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), &[]);
        let err = generate(
            &ctx,
            PipelineFormat::Json,
            false,
            Some(&dir.path().join("missing.txt")),
        )
        .unwrap_err();
        assert!(matches!(err, CliError::Config { .. }));
    }

    #[test]
    fn test_invalid_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipegen.toml");
        fs::write(&path, "default_timeout_minutes = \"soon\"").unwrap();
        let ctx = Context {
            settings: Some(path),
            ..context(dir.path(), &[])
        };
        let err = execute(&Commands::Docs, &ctx).unwrap_err();
        assert!(matches!(err, CliError::Config { .. }));
    }
}

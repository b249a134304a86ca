//! pipegen CLI
//!
//! Prints the Buildkite pipeline of the current build on stdout.

// The panic hook reports on stderr
#![allow(clippy::print_stderr)]

use pipegen::cli::{self, Commands, EXIT_OK, exit_code_for, render_error};
use pipegen::commands::{Context, execute, write_output};
use pipegen::tracing::init_tracing;
use std::io;

fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    let cli = cli::parse();

    if let Err(err) = init_tracing(cli.log_format, cli.level) {
        eprintln!("{err:?}");
    }

    let command = cli.command.clone().unwrap_or_else(Commands::default_generate);
    let span = pipegen::command_span!(command.name());
    let _guard = span.enter();

    let ctx = Context::from_process(cli.repo.clone(), cli.settings.clone());
    let result = execute(&command, &ctx)
        .and_then(|output| write_output(&mut io::stdout().lock(), &output));
    let exit_code = match result {
        Ok(()) => EXIT_OK,
        Err(err) => {
            tracing::debug!(command = command.name(), "command failed");
            render_error(&err);
            exit_code_for(&err)
        }
    };
    std::process::exit(exit_code);
}

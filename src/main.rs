mod cli;
mod commands;
mod config;
mod paths;
mod progress;
mod runner;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use resgraph::CancelToken;
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub stack_file: PathBuf,
    pub state_dir: Option<String>,
    /// Set on Ctrl-C; a running apply starts no new steps
    pub cancel: CancelToken,
}

/// Token cancelled by the first Ctrl-C; a second one exits at once
fn interrupt_token() -> CancelToken {
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    let installed = ctrlc::set_handler(move || {
        if handler.is_cancelled() {
            std::process::exit(130);
        }
        log::warn!("Interrupted, waiting for running steps to finish");
        handler.cancel();
    });
    if let Err(e) = installed {
        log::warn!("Could not install Ctrl-C handler: {e}");
    }
    cancel
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        stack_file: paths::expand(&cli.stack_file),
        state_dir: cli.state_dir,
        cancel: interrupt_token(),
    };

    match cli.command {
        Command::Plan { target } => commands::stack::plan(&ctx, target.as_deref()),
        Command::Apply { target, run } => commands::stack::apply(&ctx, target.as_deref(), &run),
        Command::Destroy { run } => commands::stack::destroy(&ctx, &run),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "strata", &mut io::stdout());
            Ok(())
        }
    }
}

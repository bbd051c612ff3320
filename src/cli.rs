use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "strata")]
#[command(version)]
#[command(about = "Plan and apply declarative infrastructure stacks", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Stack file to load (TOML or JSON)
    #[arg(
        long,
        env = "STRATA_STACK_FILE",
        default_value = "stack.toml",
        global = true
    )]
    pub stack_file: String,

    /// Directory holding per-stack state files
    #[arg(long, global = true)]
    pub state_dir: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change
    Plan {
        /// Only resources matching `type`, `name` or `type::name`, plus their dependencies
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Converge the stack to its declaration
    Apply {
        /// Only resources matching `type`, `name` or `type::name`, plus their dependencies
        #[arg(short, long)]
        target: Option<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Delete every resource recorded in state
    Destroy {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Resources applied concurrently within a batch
    #[arg(short = 'j', long, default_value = "4", value_parser = clap::value_parser!(u16).range(1..=128))]
    pub parallelism: u16,

    /// Stop after the first batch with a failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

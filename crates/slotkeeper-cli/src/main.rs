#![forbid(unsafe_code)]

mod cmd;
mod output;
mod worker;

use clap::{CommandFactory, Parser, Subcommand};
use output::OutputMode;
use std::env;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "sk: exclusive task-slot allocation for rating pools",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Alias for `--format json`.
    #[arg(long, global = true, hide = true)]
    json: bool,

    /// Worker identity (skips env resolution).
    #[arg(long, global = true)]
    worker: Option<String>,

    /// Slot store database path.
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Config file to use instead of `.slotkeeper/config.toml`.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn output_mode(&self) -> OutputMode {
        output::resolve_output_mode(self.format, self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Setup",
        about = "Create slots for a range of tasks",
        long_about = "Create the slot store if needed and add available slots for each task.",
        after_help = "EXAMPLES:\n    # Three slots for tasks 1..=50\n    sk init --tasks 50\n\n    # Five slots for tasks 101..=120\n    sk init --tasks 20 --first-task 101 --slots 5"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Workers",
        about = "Claim a slot",
        long_about = "Claim one available slot for the resolved worker identity.",
        after_help = "EXAMPLES:\n    # Claim anywhere\n    sk --worker rater-7 claim\n\n    # Claim within task 12\n    SLOTKEEPER_WORKER=rater-7 sk claim --task 12"
    )]
    Claim(cmd::claim::ClaimArgs),

    #[command(
        next_help_heading = "Workers",
        about = "Complete a held slot",
        long_about = "Mark a slot the worker holds as completed. Repeating a completion succeeds.",
        after_help = "EXAMPLES:\n    sk --worker rater-7 complete --task 12 --slot 2"
    )]
    Complete(cmd::complete::CompleteArgs),

    #[command(
        next_help_heading = "Operators",
        about = "List slots",
        long_about = "List every slot with its status, holder, elapsed time, and timeout flag.",
        after_help = "EXAMPLES:\n    # All tasks\n    sk list\n\n    # One task, machine-readable\n    sk list --task 2 --format json"
    )]
    List(cmd::list::ListArgs),

    #[command(
        next_help_heading = "Operators",
        about = "Release in-progress slots",
        long_about = "Return in-progress slots to available. Completed slots are never released.",
        after_help = "EXAMPLES:\n    # Force-release one slot\n    sk release --task 2 --slot 1\n\n    # Release everything in progress for a task\n    sk release --task 2 --all\n\n    # Abandon your own claim\n    sk --worker rater-7 release --task 2 --slot 1"
    )]
    Release(cmd::release::ReleaseArgs),

    #[command(
        next_help_heading = "Operators",
        about = "Reclaim timed-out slots",
        long_about = "Release in-progress slots whose claim is older than the timeout window.",
        after_help = "EXAMPLES:\n    # One pass with the configured window\n    sk cleanup\n\n    # Custom window\n    sk cleanup --timeout-minutes 90\n\n    # Sweep every minute\n    sk cleanup --watch --interval-secs 60"
    )]
    Cleanup(cmd::cleanup::CleanupArgs),

    #[command(
        next_help_heading = "Operators",
        about = "Show per-task counts",
        long_about = "Show available, in-progress, completed, and timed-out counts per task."
    )]
    Stats(cmd::stats::StatsArgs),

    #[command(
        next_help_heading = "Setup",
        about = "Generate shell completion scripts",
        long_about = "Generate shell completion scripts for supported shells.",
        after_help = "EXAMPLES:\n    sk completions bash\n    sk completions zsh"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("SLOTKEEPER_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "slotkeeper=debug,info"
        } else {
            "slotkeeper=info,warn"
        })
    });

    let format = env::var("SLOTKEEPER_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Usage errors exit 1 like runtime errors; `--help` and `--version` exit 0.
fn usage_exit_code(err: &clap::Error) -> i32 {
    i32::from(err.use_stderr())
}

fn main() -> anyhow::Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            err.print()?;
            std::process::exit(usage_exit_code(&err));
        }
    };
    init_tracing(cli.verbose);

    if let Commands::Completions(ref args) = cli.command {
        let mut command = Cli::command();
        return cmd::completions::run_completions(args.shell, &mut command);
    }

    let project_root = env::current_dir()?;
    let output = cli.output_mode();
    let ctx = cmd::Context::resolve(
        &project_root,
        cli.config.as_deref(),
        cli.db.as_deref(),
        output,
        cli.worker.clone(),
    )?;
    debug!(db = %ctx.db_path.display(), "resolved slot store");

    match cli.command {
        Commands::Init(ref args) => cmd::init::run_init(args, &ctx),
        Commands::Claim(ref args) => cmd::claim::run_claim(args, &ctx),
        Commands::Complete(ref args) => cmd::complete::run_complete(args, &ctx),
        Commands::List(ref args) => cmd::list::run_list(args, &ctx),
        Commands::Release(ref args) => cmd::release::run_release(args, &ctx),
        Commands::Cleanup(ref args) => cmd::cleanup::run_cleanup(args, &ctx),
        Commands::Stats(ref args) => cmd::stats::run_stats(args, &ctx),
        Commands::Completions(_) => Ok(()),
    }
}

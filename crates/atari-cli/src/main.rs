mod cmd;
mod root;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "atari",
    about = "Autonomous issue-drain supervisor",
    version,
    propagate_version = true
)]
struct Cli {
    /// Working directory (default: auto-detect from .atari/ or .git/)
    #[arg(long, global = true, env = "ATARI_ROOT")]
    workdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .atari/ with a default config
    Init,

    /// Run the drain until interrupted
    Start {
        /// Override the configured assistant model
        #[arg(long)]
        model: Option<String>,

        /// Override the per-bead failure budget
        #[arg(long)]
        max_failures: Option<u32>,

        /// Process a single bead, then exit
        #[arg(long)]
        once: bool,
    },

    /// Show drain state
    Status {
        /// Output raw state JSON
        #[arg(long, short = 'j')]
        json: bool,
    },

    /// Ask the observer a question about drain activity
    Ask { question: String },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .init();

    let workdir = root::resolve_workdir(cli.workdir.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&workdir),
        Commands::Start {
            model,
            max_failures,
            once,
        } => cmd::start::run(&workdir, model, max_failures, once),
        Commands::Status { json } => cmd::status::run(&workdir, json),
        Commands::Ask { question } => cmd::ask::run(&workdir, &question),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

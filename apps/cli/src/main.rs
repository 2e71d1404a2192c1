//! RagTune CLI
//!
//! Provides the `ragtune` command for QLoRA fine-tuning of causal language
//! models on context-grounded question answering data.

mod commands;

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{init, list, prepare, train};

/// RagTune - QLoRA fine-tuning for retrieval-augmented answering
#[derive(Parser, Debug)]
#[command(
    name = "ragtune",
    author,
    version,
    about = "RagTune - QLoRA fine-tuning for context-grounded QA",
    long_about = "RagTune fine-tunes a 4-bit quantized causal language model with LoRA adapters\nso that it answers questions using only the supplied context."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a starter job file
    ///
    /// Creates `ragtune.toml` with every section spelled out at its default.
    Init {
        /// Target directory (defaults to the current directory)
        path: Option<PathBuf>,

        /// Overwrite an existing job file
        #[arg(long)]
        force: bool,
    },

    /// Load and filter the dataset without training
    ///
    /// Writes the kept records to `dataset.jsonl` in the output directory.
    Prepare {
        /// Job file
        #[arg(short, long, default_value = init::JOB_FILE)]
        config: PathBuf,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a fine-tuning job
    ///
    /// Ctrl-C stops at the next micro-batch and writes a checkpoint that
    /// `--resume latest` picks up.
    Train {
        /// Job file
        #[arg(short, long, default_value = init::JOB_FILE)]
        config: PathBuf,

        /// Resume from `none`, `latest`, or a checkpoint directory
        #[arg(long, default_value = "none")]
        resume: String,

        /// Override `training.output_dir`
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Walk the schedule and write artifacts without updating weights
        #[arg(long)]
        dry_run: bool,

        /// Stream progress as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// List fine-tuning runs under a directory
    List {
        /// Directory holding run output directories
        #[arg(default_value = "outputs")]
        root: PathBuf,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    // RUST_LOG wins over --log-level when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::Init { path, force } => init::execute(path, force)?,
        Command::Prepare { config, json } => prepare::execute(&config, json).await?,
        Command::Train { config, resume, output_dir, dry_run, json } => {
            train::execute(&config, &resume, output_dir, dry_run, json).await?;
        }
        Command::List { root, json } => list::execute(&root, json)?,
    }

    Ok(())
}

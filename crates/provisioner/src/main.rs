//! GPU workstation provisioner CLI.
//!
//! Installs everything a ComfyUI + FLUX server needs on a fresh GPU box and
//! then becomes that server.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::config::ConfigCommand;
use commands::run::RunCommand;
use commands::status::StatusCommand;

/// GPU Provisioner - ComfyUI + FLUX workstation setup.
#[derive(Parser)]
#[command(
    name = "provision",
    version,
    about = "Provision a GPU workstation and launch ComfyUI",
    long_about = "Provision a GPU workstation for ComfyUI + FLUX.\n\n\
                  Installs system packages, Miniconda, a pinned Python environment\n\
                  with PyTorch, the application and plugin repositories and the model\n\
                  weights, then replaces itself with the server process.\n\n\
                  Every step is idempotent - re-running after an interruption only\n\
                  does the work that is still missing."
)]
#[command(propagate_version = true, args_conflicts_with_subcommands = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override file with KEY=value lines.
    #[arg(long, global = true, value_name = "FILE", default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunCommand,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage and launch the server (the default).
    Run(RunCommand),

    /// Show which stages are satisfied without changing anything.
    Status(StatusCommand),

    /// Show the resolved configuration and where each value came from.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose {
        "info,gpu_provisioner=debug"
    } else {
        "warn,gpu_provisioner=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Run(cli.run)) {
        Commands::Run(cmd) => cmd.run(&cli.env_file).await,
        Commands::Status(cmd) => cmd.run(&cli.env_file).await,
        Commands::Config => ConfigCommand.run(&cli.env_file),
    }
}

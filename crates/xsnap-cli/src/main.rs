use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::filter::EnvFilter;

mod commands;
mod config;
mod host;

use commands::check::CheckCommand;
use commands::dump::DumpCommand;
use commands::lockdown::LockdownCommand;
use commands::new::NewCommand;
use commands::purify::PurifyCommand;
use commands::run::RunCommand;

#[derive(Parser)]
#[command(name = "xsnap", version, about = "xsnap machine snapshot shell")]
struct Cli {
    /// Configuration file (default: nearest xsnap.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log pass summaries and snapshot sizes
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a machine and write its snapshot
    New(NewCommand),
    /// Resume a snapshot and run its jobs and timers
    Run(RunCommand),
    /// Print the content of a snapshot
    Dump(DumpCommand),
    /// Check aliased values of a snapshot
    Check(CheckCommand),
    /// Lock a snapshot down and harden globalThis
    Lockdown(LockdownCommand),
    /// Report impure values of a snapshot
    Purify(PurifyCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(version = xsnap_core::version(), "xsnap");

    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::New(cmd) => cmd.run(&config),
        Commands::Run(cmd) => cmd.run(&config),
        Commands::Dump(cmd) => cmd.run(),
        Commands::Check(cmd) => cmd.run(&config),
        Commands::Lockdown(cmd) => cmd.run(&config),
        Commands::Purify(cmd) => cmd.run(&config),
    }
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::filter::EnvFilter;

mod commands;
mod config;

use commands::{bgerror::BgErrorCommand, info::InfoCommand, threads::ThreadsCommand, wait::WaitCommand};

#[derive(Parser)]
#[command(name = "heron", version, about = "Heron execution core diagnostics")]
struct Cli {
    /// Configuration file (defaults to heron.toml or .heronrc.toml in an ancestor directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a cooperative wait and print its report
    Wait(WaitCommand),
    /// Dispatch a background error through a handler
    Bgerror(BgErrorCommand),
    /// Run bound threads that share a thread variable
    Threads(ThreadsCommand),
    /// Show the effective configuration
    Info(InfoCommand),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Wait(cmd) => cmd.run(config)?,
        Commands::Bgerror(cmd) => cmd.run(config)?,
        Commands::Threads(cmd) => cmd.run(config)?,
        Commands::Info(cmd) => cmd.run(&config),
    }

    Ok(())
}

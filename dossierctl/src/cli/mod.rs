//! Command-line surface.

pub mod config;
pub mod run;
pub mod status;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "dossierctl",
    version,
    about = "Run and inspect Dossier investigations"
)]
pub struct Cli {
    /// Config file (defaults to $DOSSIER_CONFIG, dossier.toml, config/dossier.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Load environment overrides from this file instead of ./.env
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an investigation described by a spec file until it settles
    Run(RunArgs),
    /// Show the stored status of an investigation
    Status(StatusArgs),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Investigation spec file (TOML)
    pub spec: PathBuf,
    /// Print progress events as they happen
    #[arg(long)]
    pub follow: bool,
    /// Give up waiting after this long, e.g. "90s" or "10m"
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10m")]
    pub timeout: Duration,
    /// Print the final snapshot as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, clap::Args)]
pub struct StatusArgs {
    /// Investigation id
    pub id: String,
    /// Store directory (defaults to the configured one)
    #[arg(long)]
    pub store_dir: Option<PathBuf>,
    /// Print the snapshot as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Load and validate configuration, reporting warnings
    Check,
    /// Print a config file with every default filled in
    PrintDefault,
}

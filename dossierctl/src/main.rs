use anyhow::Result;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use dossierctl::ConfigLoader;
use dossierctl::cli::{Cli, Command, ConfigAction, config, run, status};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Config {
        action: ConfigAction::PrintDefault,
    } = &cli.command
    {
        print!("{}", config::print_default()?);
        return Ok(());
    }

    let load = ConfigLoader::new()
        .with_config_path(cli.config.clone())
        .with_env_file(cli.env_file.clone())
        .load()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| load.config.log_filter.as_str().into()),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    for warning in &load.warnings.items {
        match &warning.hint {
            Some(hint) => warn!(hint = %hint, "{}", warning.message),
            None => warn!("{}", warning.message),
        }
    }

    match &cli.command {
        Command::Run(args) => run::run(args, &load.config).await,
        Command::Status(args) => status::status(args, &load.config).await,
        Command::Config {
            action: ConfigAction::Check,
        } => {
            print!("{}", config::check_report(&load));
            Ok(())
        }
        Command::Config {
            action: ConfigAction::PrintDefault,
        } => Ok(()),
    }
}

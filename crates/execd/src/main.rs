use clap::Parser;
use eyre::Result;

use execd::cli::{Cli, Commands};
use execd::commands::{Command, config::ConfigCommand, run::RunCommand, serve::ServeCommand};
use execd_core::CoordinatorConfig;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // Load .env before clap reads EXECD_* variables
    execd::cli::config::load_env()?;

    let cli = Cli::parse();
    let config = CoordinatorConfig::load(cli.config.as_deref())?;

    let log_dir = cli.log_dir.clone().or_else(|| config.logging.directory.clone());
    execd_core::utils::tracing::init_tracing(log_dir.as_deref(), config.logging.filter.as_deref())?;
    debug!(config_path = ?cli.config, "Configuration loaded");

    match cli.command {
        Commands::Serve { bind, port } => {
            ServeCommand { config, bind, port }.execute().await
        }
        Commands::Run { path, id } => RunCommand { config, path, id }.execute().await,
        Commands::Config { action } => {
            ConfigCommand {
                config,
                path: cli.config,
                action,
            }
            .execute()
            .await
        }
    }
}

//! Trading pipeline CLI application.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use trading_config::{load_config, LoggingConfig};
use trading_monitor::setup_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the file when it loads; commands report
    // configuration errors themselves.
    let logging = load_config(&cli.config).map(|c| c.logging).unwrap_or_else(|_| LoggingConfig::default());
    let level = cli.log_level.map(|l| l.as_str().to_string()).unwrap_or(logging.level.clone());
    let _guard = setup_logging(&level, cli.json_logs || logging.is_json(), logging.file.as_deref())
        .context("initialising logging")?;

    match cli.command {
        Commands::RunOnce(args) => cli::commands::run_once::run(args, &cli.config).await,
        Commands::Paper(args) => cli::commands::paper::run(args, &cli.config).await,
        Commands::Strategies => cli::commands::strategies::run().await,
        Commands::ValidateConfig => cli::commands::validate::run(&cli.config).await,
    }
}

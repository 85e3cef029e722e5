//! Validate configuration command.

use anyhow::{Context, Result};
use std::path::Path;
use trading_config::load_config;

pub async fn run(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {:?}", config_path);

    let config = load_config(config_path).with_context(|| format!("loading {}", config_path.display()))?;
    if let Err(e) = config.validate() {
        println!("Configuration error: {}", e);
        return Err(e.into());
    }

    println!("Configuration is valid!");
    println!();
    println!("App: {}", config.app.name);
    println!("Environment: {}", config.app.environment);
    println!("Log level: {}", config.logging.level);
    for exchange in &config.exchanges {
        println!(
            "Exchange: {} ({:?}){}",
            exchange.id,
            exchange.kind,
            if exchange.enabled { "" } else { " disabled" }
        );
    }
    let strategies: Vec<&str> = config.strategy_kinds().iter().map(|s| s.name()).collect();
    println!("Strategies: {}", strategies.join(", "));
    println!("Symbols: {}", config.pipeline.symbols.join(", "));
    println!(
        "Max position: {}%   Daily loss limit: {}%",
        config.risk.default_limits.max_position_pct, config.risk.default_limits.max_daily_loss_pct
    );
    println!("Consensus threshold: {}", config.aggregation.threshold);

    Ok(())
}

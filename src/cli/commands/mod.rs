//! CLI command implementations.

pub mod paper;
pub mod run_once;
pub mod strategies;
pub mod validate;

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use trading_config::{load_config, AppConfig};
use trading_core::types::Timeframe;

use crate::cli::PipelineArgs;

/// Load the configuration file and apply command-line overrides.
pub fn configure(path: &Path, args: &PipelineArgs) -> Result<AppConfig> {
    let mut config = load_config(path).with_context(|| format!("loading {}", path.display()))?;
    if !args.symbols.is_empty() {
        config.pipeline.symbols = args.symbols.clone();
    }
    if !args.timeframes.is_empty() {
        config.pipeline.timeframes = args
            .timeframes
            .iter()
            .map(|tf| tf.parse::<Timeframe>().map_err(|e| anyhow!("invalid timeframe {}: {}", tf, e)))
            .collect::<Result<_>>()?;
    }
    if let Some(account) = &args.account {
        config.pipeline.account = account.clone();
    }
    if let Some(dir) = &args.artifacts {
        config.pipeline.artifacts_dir = Some(dir.clone());
    }
    Ok(config)
}

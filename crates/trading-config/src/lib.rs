//! Configuration management.
//!
//! A TOML file overlaid with `TRADING__<SECTION>__<KEY>` environment
//! variables, e.g. `TRADING__PIPELINE__ACCOUNT=main` or
//! `TRADING__PIPELINE__SYMBOLS=BTCUSDT,ETHUSDT`.

mod settings;

pub use settings::{AppConfig, AppSettings, LoggingConfig};

use config::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

const ENV_PREFIX: &str = "TRADING";
const LIST_KEYS: &[&str] = &["pipeline.symbols", "pipeline.timeframes", "pipeline.exchanges"];

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

fn environment(overrides: Option<HashMap<String, String>>) -> Environment {
    let env = Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(",");
    LIST_KEYS
        .iter()
        .fold(env, |env, key| env.with_list_parse_key(key))
        .source(overrides)
}

/// Load configuration from a TOML file and the process environment.
pub fn load_config(path: &Path) -> Result<AppConfig, SettingsError> {
    let config = Config::builder()
        .add_source(File::from(path).required(true))
        .add_source(environment(None))
        .build()?;
    Ok(config.try_deserialize()?)
}

/// Parse configuration from TOML text, with `env` standing in for the
/// process environment.
pub fn load_config_str(toml: &str, env: HashMap<String, String>) -> Result<AppConfig, SettingsError> {
    let config = Config::builder()
        .add_source(File::from_str(toml, FileFormat::Toml))
        .add_source(environment(Some(env)))
        .build()?;
    Ok(config.try_deserialize()?)
}

impl AppConfig {
    /// Fail with every problem at once.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Invalid(problems))
        }
    }
}

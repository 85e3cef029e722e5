//! Strategy registry: tagged strategy configurations and their constructors.

use crate::{
    AlligatorConfig, AlligatorStrategy, DarvasBoxStrategy, DarvasConfig, IchimokuConfig,
    IchimokuStrategy, RenkoConfig, RenkoStrategy,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use trading_core::{
    error::StrategyError,
    traits::{SignalGenerator, StrategyConfig},
};

/// A strategy selected by its `kind` tag, carrying its own configuration.
///
/// ```toml
/// [[strategies]]
/// kind = "darvas_box"
/// breakout_bars = 2
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyKind {
    Alligator(AlligatorConfig),
    DarvasBox(DarvasConfig),
    Renko(RenkoConfig),
    Ichimoku(IchimokuConfig),
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Alligator(_) => "alligator",
            StrategyKind::DarvasBox(_) => "darvas_box",
            StrategyKind::Renko(_) => "renko",
            StrategyKind::Ichimoku(_) => "ichimoku",
        }
    }

    pub fn validate(&self) -> Result<(), StrategyError> {
        match self {
            StrategyKind::Alligator(config) => config.validate(),
            StrategyKind::DarvasBox(config) => config.validate(),
            StrategyKind::Renko(config) => config.validate(),
            StrategyKind::Ichimoku(config) => config.validate(),
        }
    }

    /// Validate the configuration and construct the generator.
    pub fn build(self) -> Result<Box<dyn SignalGenerator>, StrategyError> {
        self.validate()?;
        Ok(match self {
            StrategyKind::Alligator(config) => Box::new(AlligatorStrategy::new(config)),
            StrategyKind::DarvasBox(config) => Box::new(DarvasBoxStrategy::new(config)),
            StrategyKind::Renko(config) => Box::new(RenkoStrategy::new(config)),
            StrategyKind::Ichimoku(config) => Box::new(IchimokuStrategy::new(config)),
        })
    }

    /// Every strategy with its default configuration.
    pub fn defaults() -> Vec<StrategyKind> {
        vec![
            StrategyKind::Alligator(AlligatorConfig::default()),
            StrategyKind::DarvasBox(DarvasConfig::default()),
            StrategyKind::Renko(RenkoConfig::default()),
            StrategyKind::Ichimoku(IchimokuConfig::default()),
        ]
    }
}

/// Information about a registered strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyInfo {
    /// Registry key
    pub name: String,
    pub description: String,
    /// Default configuration as JSON
    pub default_config: serde_json::Value,
}

/// Registry for the built-in signal generators.
pub struct StrategyRegistry {
    strategies: BTreeMap<String, StrategyInfo>,
}

impl StrategyRegistry {
    /// Create a registry with all built-in strategies.
    pub fn new() -> Self {
        let mut strategies = BTreeMap::new();
        for kind in StrategyKind::defaults() {
            let name = kind.name().to_string();
            let description = match kind.clone().build() {
                Ok(generator) => generator.description().to_string(),
                Err(_) => String::new(),
            };
            let default_config = match &kind {
                StrategyKind::Alligator(c) => serde_json::to_value(c),
                StrategyKind::DarvasBox(c) => serde_json::to_value(c),
                StrategyKind::Renko(c) => serde_json::to_value(c),
                StrategyKind::Ichimoku(c) => serde_json::to_value(c),
            }
            .unwrap_or_default();

            strategies.insert(
                name.clone(),
                StrategyInfo {
                    name,
                    description,
                    default_config,
                },
            );
        }
        Self { strategies }
    }

    /// List all available strategies, ordered by name.
    pub fn list(&self) -> Vec<&StrategyInfo> {
        self.strategies.values().collect()
    }

    pub fn get(&self, name: &str) -> Option<&StrategyInfo> {
        self.strategies.get(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    pub fn names(&self) -> Vec<&String> {
        self.strategies.keys().collect()
    }

    /// Parse a strategy configuration for `name`.
    pub fn parse(&self, name: &str, config: serde_json::Value) -> Result<StrategyKind, StrategyError> {
        fn parse_config<C: DeserializeOwned>(config: serde_json::Value) -> Result<C, StrategyError> {
            serde_json::from_value(config).map_err(|e| StrategyError::InvalidConfig(e.to_string()))
        }

        Ok(match name {
            "alligator" => StrategyKind::Alligator(parse_config(config)?),
            "darvas_box" => StrategyKind::DarvasBox(parse_config(config)?),
            "renko" => StrategyKind::Renko(parse_config(config)?),
            "ichimoku" => StrategyKind::Ichimoku(parse_config(config)?),
            _ => return Err(StrategyError::NotFound(name.to_string())),
        })
    }

    /// Create a strategy instance from configuration.
    pub fn create(
        &self,
        name: &str,
        config: serde_json::Value,
    ) -> Result<Box<dyn SignalGenerator>, StrategyError> {
        self.parse(name, config)?.build()
    }

    /// Create a strategy with default configuration.
    pub fn create_default(&self, name: &str) -> Result<Box<dyn SignalGenerator>, StrategyError> {
        let info = self
            .get(name)
            .ok_or_else(|| StrategyError::NotFound(name.to_string()))?;
        self.create(name, info.default_config.clone())
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

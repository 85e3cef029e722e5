//! Configuration structures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use trading_exchange::{ExchangeConfig, ExchangeKind};
use trading_orders::OrderManagerConfig;
use trading_risk::RiskConfig;
use trading_strategies::{AggregatorConfig, StrategyKind};
use trading_workflow::PipelineConfig;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSettings,
    pub logging: LoggingConfig,
    pub exchanges: Vec<ExchangeConfig>,
    pub risk: RiskConfig,
    pub aggregation: AggregatorConfig,
    /// Empty means every strategy with its defaults
    pub strategies: Vec<StrategyKind>,
    pub pipeline: PipelineConfig,
    pub orders: OrderManagerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSettings::default(),
            logging: LoggingConfig::default(),
            exchanges: vec![ExchangeConfig::new("paper", ExchangeKind::Simulated)],
            risk: RiskConfig::default(),
            aggregation: AggregatorConfig::default(),
            strategies: Vec::new(),
            pipeline: PipelineConfig::default(),
            orders: OrderManagerConfig::default(),
        }
    }
}

/// General app settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub name: String,
    pub environment: String,
    /// Seconds between pipeline runs in continuous mode
    pub run_interval_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: "trading-pipeline".to_string(),
            environment: "development".to_string(),
            run_interval_secs: 60,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
    /// Daily-rolling log file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl AppConfig {
    /// Configured strategies, or every strategy with its defaults.
    pub fn strategy_kinds(&self) -> Vec<StrategyKind> {
        if self.strategies.is_empty() {
            StrategyKind::defaults()
        } else {
            self.strategies.clone()
        }
    }

    pub fn enabled_exchanges(&self) -> impl Iterator<Item = &ExchangeConfig> {
        self.exchanges.iter().filter(|e| e.enabled)
    }

    /// Every problem found, empty when the configuration is usable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if !matches!(self.logging.format.to_ascii_lowercase().as_str(), "pretty" | "json") {
            problems.push(format!("logging.format must be pretty or json, got {}", self.logging.format));
        }
        if self.app.run_interval_secs == 0 {
            problems.push("app.run_interval_secs must be positive".to_string());
        }

        let mut ids = BTreeSet::new();
        for exchange in &self.exchanges {
            if !ids.insert(exchange.id.as_str()) {
                problems.push(format!("exchange {} declared twice", exchange.id));
            }
            if let Err(e) = exchange.validate() {
                problems.push(e.to_string());
            }
        }
        let enabled: BTreeSet<&str> = self.enabled_exchanges().map(|e| e.id.as_str()).collect();
        if enabled.is_empty() {
            problems.push("no enabled exchange".to_string());
        }
        for id in &self.pipeline.exchanges {
            if !enabled.contains(id.as_str()) {
                problems.push(format!("pipeline.exchanges names unknown or disabled exchange {}", id));
            }
        }

        let pipeline = &self.pipeline;
        if pipeline.account.trim().is_empty() {
            problems.push("pipeline.account is empty".to_string());
        }
        if pipeline.symbols.is_empty() {
            problems.push("pipeline.symbols is empty".to_string());
        }
        if pipeline.timeframes.is_empty() {
            problems.push("pipeline.timeframes is empty".to_string());
        }
        if pipeline.candle_limit == 0 {
            problems.push("pipeline.candle_limit must be positive".to_string());
        }

        let aggregation = &self.aggregation;
        if !(0.0..=1.0).contains(&aggregation.min_confidence) {
            problems.push("aggregation.min_confidence must be within [0, 1]".to_string());
        }
        if aggregation.max_per_symbol == 0 {
            problems.push("aggregation.max_per_symbol must be positive".to_string());
        }
        if aggregation.threshold < 0.0 || aggregation.confidence_boost <= 0.0 {
            problems.push("aggregation.threshold and confidence_boost must be positive".to_string());
        }
        if aggregation.timeframe_weights.values().any(|w| *w < 0.0) {
            problems.push("aggregation.timeframe_weights must not be negative".to_string());
        }

        for strategy in &self.strategies {
            if let Err(e) = strategy.validate() {
                problems.push(format!("strategy {}: {}", strategy.name(), e));
            }
        }

        let limits = std::iter::once((
            "default".to_string(),
            self.risk.default_limits.max_position_pct,
            self.risk.default_limits.max_daily_loss_pct,
        ))
        .chain(
            self.risk
                .profiles
                .iter()
                .map(|p| (p.account.clone(), p.max_position_pct, p.max_daily_loss_pct)),
        );
        for (name, position_pct, loss_pct) in limits {
            if position_pct <= rust_decimal::Decimal::ZERO || loss_pct <= rust_decimal::Decimal::ZERO {
                problems.push(format!("risk limits of {} must be positive", name));
            }
        }

        problems
    }
}

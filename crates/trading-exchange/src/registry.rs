//! Compile-time registry of connector implementations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use trading_core::error::ExchangeError;
use trading_core::traits::ExchangeConnector;

use crate::binance::{BinanceConfig, BinanceConnector};
use crate::rate_limiter::RateLimitRule;
use crate::retry::RetryPolicy;
use crate::signing::Credentials;
use crate::simulated::{SimulatedConfig, SimulatedConnector};
use crate::ws::StreamConfig;

/// Connector implementations known to this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Binance,
    Simulated,
}

impl ExchangeKind {
    pub fn all() -> &'static [ExchangeKind] {
        &[ExchangeKind::Binance, ExchangeKind::Simulated]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Binance => "binance",
            ExchangeKind::Simulated => "simulated",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExchangeKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ExchangeError::UnknownExchange(s.to_string()))
    }
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

/// One configured exchange connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub id: String,
    pub kind: ExchangeKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_secret_env: Option<String>,
    /// Empty means the connector's defaults
    #[serde(default)]
    pub rate_limits: Vec<RateLimitRule>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub recv_window_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub simulated: SimulatedConfig,
}

impl ExchangeConfig {
    pub fn new(id: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: true,
            rest_url: None,
            ws_url: None,
            api_key_env: None,
            api_secret_env: None,
            rate_limits: Vec::new(),
            timeout_ms: default_timeout_ms(),
            recv_window_ms: None,
            retry: RetryPolicy::default(),
            stream: StreamConfig::default(),
            simulated: SimulatedConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ExchangeError> {
        if self.id.trim().is_empty() {
            return Err(ExchangeError::Configuration("exchange id is empty".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ExchangeError::Configuration(format!("{}: timeout_ms must be positive", self.id)));
        }
        if self.api_key_env.is_some() != self.api_secret_env.is_some() {
            return Err(ExchangeError::Configuration(format!(
                "{}: api_key_env and api_secret_env must be set together",
                self.id
            )));
        }
        for rule in &self.rate_limits {
            rule.validate()?;
        }
        Ok(())
    }

    /// Bind credentials from the environment, when configured.
    fn credentials(&self) -> Result<Option<Credentials>, ExchangeError> {
        match (&self.api_key_env, &self.api_secret_env) {
            (Some(key), Some(secret)) => Credentials::from_env(key, secret).map(Some),
            _ => Ok(None),
        }
    }

    /// Construct the connector this entry describes.
    pub fn build(&self) -> Result<Arc<dyn ExchangeConnector>, ExchangeError> {
        self.validate()?;
        match self.kind {
            ExchangeKind::Binance => {
                let mut config = BinanceConfig::new(
                    self.rest_url.clone().unwrap_or_else(|| "https://api.binance.com".to_string()),
                    self.ws_url
                        .clone()
                        .unwrap_or_else(|| "wss://stream.binance.com:9443".to_string()),
                );
                config.id = self.id.clone();
                config.credentials = self.credentials()?;
                config.timeout = Duration::from_millis(self.timeout_ms);
                config.retry = self.retry.clone();
                config.stream = self.stream.clone();
                if let Some(window) = self.recv_window_ms {
                    config.recv_window_ms = window;
                }
                if !self.rate_limits.is_empty() {
                    config.rate_limits = self.rate_limits.clone();
                }
                Ok(Arc::new(BinanceConnector::new(config)?))
            }
            ExchangeKind::Simulated => Ok(Arc::new(self.build_simulated())),
        }
    }

    /// Construct a simulated connector regardless of `kind`, for paper runs.
    pub fn build_simulated(&self) -> SimulatedConnector {
        SimulatedConnector::new(SimulatedConfig {
            id: self.id.clone(),
            ..self.simulated.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_str() {
        assert_eq!("Binance".parse::<ExchangeKind>().unwrap(), ExchangeKind::Binance);
        assert_eq!("simulated".parse::<ExchangeKind>().unwrap(), ExchangeKind::Simulated);
        assert!(matches!(
            "kraken".parse::<ExchangeKind>(),
            Err(ExchangeError::UnknownExchange(_))
        ));
    }

    #[test]
    fn test_build_uses_configured_id() {
        let connector = ExchangeConfig::new("paper-1", ExchangeKind::Simulated).build().unwrap();
        assert_eq!(connector.id(), "paper-1");

        let connector = ExchangeConfig::new("binance-main", ExchangeKind::Binance).build().unwrap();
        assert_eq!(connector.id(), "binance-main");
    }

    #[test]
    fn test_credentials_bound_from_env() {
        let mut config = ExchangeConfig::new("binance", ExchangeKind::Binance);
        config.api_key_env = Some("TRADING_TEST_MISSING_KEY".into());
        assert!(config.validate().is_err());

        config.api_secret_env = Some("TRADING_TEST_MISSING_SECRET".into());
        assert!(matches!(config.build(), Err(ExchangeError::Configuration(_))));
    }

    #[test]
    fn test_deserialize() {
        let json = serde_json::json!({
            "id": "binance",
            "kind": "binance",
            "rate_limits": [{"calls": 5, "period_ms": 1000, "key": "order"}],
            "retry": {"max_attempts": 5}
        });
        let config: ExchangeConfig = serde_json::from_value(json).unwrap();
        assert!(config.enabled);
        assert_eq!(config.timeout_ms, 10_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);
        assert_eq!(config.rate_limits[0].key.as_deref(), Some("order"));
    }
}

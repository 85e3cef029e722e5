//! Strategy signals and aggregated consensus signals.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{Side, Timeframe};
use crate::error::StrategyError;

/// Direction of a strategy signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    Buy,
    Sell,
    /// Close an existing long
    ExitBuy,
    /// Close an existing short
    ExitSell,
}

impl SignalType {
    /// Whether this opens a position (as opposed to closing one).
    pub fn is_entry(&self) -> bool {
        matches!(self, SignalType::Buy | SignalType::Sell)
    }

    /// Order side needed to act on the signal.
    pub fn side(&self) -> Side {
        match self {
            SignalType::Buy | SignalType::ExitSell => Side::Buy,
            SignalType::Sell | SignalType::ExitBuy => Side::Sell,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            SignalType::Buy => SignalType::Sell,
            SignalType::Sell => SignalType::Buy,
            SignalType::ExitBuy => SignalType::ExitSell,
            SignalType::ExitSell => SignalType::ExitBuy,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalType::Buy => "BUY",
            SignalType::Sell => "SELL",
            SignalType::ExitBuy => "EXIT_BUY",
            SignalType::ExitSell => "EXIT_SELL",
        };
        f.write_str(s)
    }
}

/// Extra context attached by the producing strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalMetadata {
    pub stop_loss: Option<f64>,
    pub target_price: Option<f64>,
    /// Indicator values at the signal bar
    #[serde(default)]
    pub indicators: BTreeMap<String, f64>,
    #[serde(default)]
    pub reason: String,
}

/// A single trading signal from one strategy on one timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub signal_type: SignalType,
    pub price: f64,
    /// Unix milliseconds of the bar that produced the signal
    pub timestamp: i64,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub strategy_name: String,
    pub timeframe: Timeframe,
    #[serde(default)]
    pub metadata: SignalMetadata,
}

impl Signal {
    pub fn new(
        symbol: impl Into<String>,
        signal_type: SignalType,
        price: f64,
        timestamp: i64,
        confidence: f64,
        strategy_name: impl Into<String>,
        timeframe: Timeframe,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            signal_type,
            price,
            timestamp,
            confidence,
            strategy_name: strategy_name.into(),
            timeframe,
            metadata: SignalMetadata::default(),
        }
    }

    pub fn with_stop_loss(mut self, stop: f64) -> Self {
        self.metadata.stop_loss = Some(stop);
        self
    }

    pub fn with_target(mut self, target: f64) -> Self {
        self.metadata.target_price = Some(target);
        self
    }

    pub fn with_indicator(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metadata.indicators.insert(name.into(), value);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.metadata.reason = reason.into();
        self
    }

    /// Reject signals that break the signal contract.
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.symbol.trim().is_empty() {
            return Err(StrategyError::MalformedSignal("empty symbol".into()));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(StrategyError::MalformedSignal(format!(
                "invalid price {} for {}",
                self.price, self.symbol
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(StrategyError::MalformedSignal(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// Agreement of several strategies/timeframes on one direction for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusSignal {
    pub symbol: String,
    /// Buy or Sell
    pub signal_type: SignalType,
    /// Price of the most recent contributing signal
    pub price: f64,
    pub timestamp: i64,
    pub confidence: f64,
    /// Sum of confidence x timeframe weight for this direction
    pub score: f64,
    /// Same sum for the opposite direction
    pub opposing_score: f64,
    pub contributing_strategies: BTreeSet<String>,
    pub contributing_timeframes: BTreeSet<Timeframe>,
    pub constituents: Vec<Signal>,
}

impl ConsensusSignal {
    pub fn side(&self) -> Side {
        self.signal_type.side()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(price: f64, confidence: f64) -> Signal {
        Signal::new("BTCUSDT", SignalType::Buy, price, 1, confidence, "alligator", Timeframe::Hour1)
    }

    #[test]
    fn test_validate() {
        assert!(signal(100.0, 0.8).validate().is_ok());
        assert!(signal(f64::NAN, 0.8).validate().is_err());
        assert!(signal(-1.0, 0.8).validate().is_err());
        assert!(signal(100.0, 1.2).validate().is_err());

        let mut empty = signal(100.0, 0.5);
        empty.symbol = " ".into();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_signal_sides() {
        assert_eq!(SignalType::Buy.side(), Side::Buy);
        assert_eq!(SignalType::ExitBuy.side(), Side::Sell);
        assert_eq!(SignalType::ExitSell.side(), Side::Buy);
        assert!(!SignalType::ExitSell.is_entry());
        assert_eq!(SignalType::Sell.opposite(), SignalType::Buy);
    }

    #[test]
    fn test_builder_metadata() {
        let s = signal(100.0, 0.7)
            .with_stop_loss(95.0)
            .with_target(110.0)
            .with_indicator("atr", 2.5)
            .with_reason("breakout");
        assert_eq!(s.metadata.stop_loss, Some(95.0));
        assert_eq!(s.metadata.target_price, Some(110.0));
        assert_eq!(s.metadata.indicators.get("atr"), Some(&2.5));
        assert_eq!(s.metadata.reason, "breakout");

        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["signal_type"], "BUY");
    }
}

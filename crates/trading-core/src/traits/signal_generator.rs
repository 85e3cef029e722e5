//! Signal generator trait definitions.

use crate::error::StrategyError;
use crate::types::{Bar, Signal, Timeframe};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration trait for strategies.
pub trait StrategyConfig: Send + Sync + Clone + 'static {
    /// Validate the configuration.
    fn validate(&self) -> Result<(), StrategyError>;
}

/// Snapshot of a generator for monitoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyState {
    pub name: String,
    /// Whether any stored history is long enough to produce signals
    pub is_warmed_up: bool,
    /// Candles stored across all (symbol, timeframe) histories
    pub bars_processed: usize,
    pub signals_generated: usize,
    /// Latest indicator values of the most recently evaluated history
    pub indicators: HashMap<String, f64>,
    /// Strategy-specific state
    pub custom: serde_json::Value,
}

/// A technical-analysis engine that turns candle histories into signals.
///
/// Histories are kept per (symbol, timeframe) and only move forward in
/// time. `generate_signals` replays the stored history, so calling it twice
/// without new data yields the same signals.
pub trait SignalGenerator: Send + Sync {
    /// Unique name of the generator, used as `Signal::strategy_name`.
    fn name(&self) -> &str;

    /// Merge candles into the (symbol, timeframe) history.
    ///
    /// Candles older than the newest stored one are ignored; a candle with
    /// the same timestamp replaces it. Returns the number of candles taken.
    fn update_data(&mut self, symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> usize;

    /// Signals for the most recent bars of the history.
    fn generate_signals(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Vec<Signal>, StrategyError>;

    /// Drop all stored histories.
    fn reset(&mut self);

    fn state(&self) -> StrategyState;

    /// Bars needed before any signal can be produced.
    fn warmup_period(&self) -> usize;

    fn is_warmed_up(&self, bars_available: usize) -> bool {
        bars_available >= self.warmup_period()
    }

    fn description(&self) -> &str {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingGenerator {
        bars: usize,
    }

    impl SignalGenerator for CountingGenerator {
        fn name(&self) -> &str {
            "counting"
        }

        fn update_data(&mut self, _symbol: &str, _timeframe: Timeframe, bars: &[Bar]) -> usize {
            self.bars += bars.len();
            bars.len()
        }

        fn generate_signals(
            &mut self,
            _symbol: &str,
            _timeframe: Timeframe,
        ) -> Result<Vec<Signal>, StrategyError> {
            Ok(Vec::new())
        }

        fn reset(&mut self) {
            self.bars = 0;
        }

        fn state(&self) -> StrategyState {
            StrategyState {
                name: self.name().to_string(),
                bars_processed: self.bars,
                ..Default::default()
            }
        }

        fn warmup_period(&self) -> usize {
            20
        }
    }

    #[test]
    fn test_generator_warmup() {
        let mut generator = CountingGenerator { bars: 0 };
        let bars = vec![Bar::new(1, 1.0, 1.0, 1.0, 1.0, 1.0); 5];

        assert_eq!(generator.update_data("BTCUSDT", Timeframe::Hour1, &bars), 5);
        assert_eq!(generator.state().bars_processed, 5);
        assert!(!generator.is_warmed_up(19));
        assert!(generator.is_warmed_up(20));

        generator.reset();
        assert_eq!(generator.state().bars_processed, 0);
    }
}

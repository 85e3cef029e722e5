//! Renko brick strategy.
//!
//! Closes are aggregated into fixed-size bricks (a fixed size or a multiple
//! of ATR). A signed run-length counter tracks the brick trend and three
//! patterns are traded:
//! - reversal: a trend of at least `min_trend_bricks` followed by
//!   `reversal_bricks` opposite bricks
//! - continuation: the trend reaches exactly `continuation_bricks`
//! - pullback: a trend of at least `min_trend_bricks`, a single opposite
//!   brick, then a resume

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use trading_core::{
    error::StrategyError,
    traits::{SignalGenerator, StrategyConfig, StrategyState},
    types::{Bar, Signal, SignalType, Timeframe},
};
use trading_indicators::Atr;

use crate::history::{recent_signals, CandleStore};

/// Configuration for the Renko strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenkoConfig {
    /// Fixed brick size; derived from ATR when unset
    pub brick_size: Option<f64>,
    pub atr_period: usize,
    pub atr_multiplier: f64,
    pub reversal_bricks: usize,
    pub min_trend_bricks: usize,
    pub continuation_bricks: usize,
    /// Emit signals from the last N bars only (0 = whole history)
    pub signal_window: usize,
}

impl Default for RenkoConfig {
    fn default() -> Self {
        Self {
            brick_size: None,
            atr_period: 14,
            atr_multiplier: 1.0,
            reversal_bricks: 2,
            min_trend_bricks: 3,
            continuation_bricks: 3,
            signal_window: 1,
        }
    }
}

impl StrategyConfig for RenkoConfig {
    fn validate(&self) -> Result<(), StrategyError> {
        if let Some(size) = self.brick_size {
            if !size.is_finite() || size <= 0.0 {
                return Err(StrategyError::InvalidConfig(
                    "brick_size must be positive".into(),
                ));
            }
        }
        if self.atr_period == 0 || self.atr_multiplier <= 0.0 {
            return Err(StrategyError::InvalidConfig(
                "ATR period and multiplier must be positive".into(),
            ));
        }
        if self.reversal_bricks == 0 || self.min_trend_bricks == 0 || self.continuation_bricks == 0 {
            return Err(StrategyError::InvalidConfig(
                "Brick counts must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// A single Renko brick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Brick {
    /// +1 for an up brick, -1 for a down brick
    pub direction: i8,
    pub open: f64,
    pub close: f64,
    /// Index of the bar that completed the brick
    pub bar_index: usize,
    /// Signed run length including this brick
    pub trend: i64,
}

/// Upper bound on the bricks one bar can add.
pub const MAX_BRICKS_PER_BAR: usize = 10_000;

/// Build bricks from closing prices, anchored at the first close.
///
/// A bar adds at most [`MAX_BRICKS_PER_BAR`] bricks, and none once `size`
/// falls below the float resolution of the price.
pub fn build_bricks(bars: &[Bar], size: f64) -> Vec<Brick> {
    let mut bricks = Vec::new();
    let Some(first) = bars.first() else {
        return bricks;
    };
    if !size.is_finite() || size <= 0.0 {
        return bricks;
    }

    let mut anchor = first.close;
    let mut trend = 0i64;
    let mut push = |bricks: &mut Vec<Brick>, direction: i8, open: f64, bar_index: usize| {
        let dir = direction as i64;
        trend = if trend.signum() == dir { trend + dir } else { dir };
        let brick = Brick {
            direction,
            open,
            close: open + size * direction as f64,
            bar_index,
            trend,
        };
        bricks.push(brick);
        brick.close
    };

    for (i, bar) in bars.iter().enumerate().skip(1) {
        let mut added = 0;
        while added < MAX_BRICKS_PER_BAR && anchor + size > anchor && bar.close >= anchor + size {
            anchor = push(&mut bricks, 1, anchor, i);
            added += 1;
        }
        while added < MAX_BRICKS_PER_BAR && anchor - size < anchor && bar.close <= anchor - size {
            anchor = push(&mut bricks, -1, anchor, i);
            added += 1;
        }
    }
    bricks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    Reversal,
    Continuation,
    Pullback,
}

impl Pattern {
    fn base_confidence(self) -> f64 {
        match self {
            Pattern::Reversal => 0.45,
            Pattern::Continuation => 0.5,
            Pattern::Pullback => 0.55,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Pattern::Reversal => "reversal",
            Pattern::Continuation => "continuation",
            Pattern::Pullback => "pullback",
        }
    }
}

/// Renko brick strategy.
pub struct RenkoStrategy {
    config: RenkoConfig,
    history: CandleStore,
    signals_generated: usize,
    last_trend: i64,
    indicators: HashMap<String, f64>,
}

impl RenkoStrategy {
    pub fn new(config: RenkoConfig) -> Self {
        Self {
            config,
            history: CandleStore::new(0),
            signals_generated: 0,
            last_trend: 0,
            indicators: HashMap::new(),
        }
    }

    fn brick_size(&self, bars: &[Bar]) -> Option<f64> {
        match self.config.brick_size {
            Some(size) => Some(size),
            None => Atr::new(self.config.atr_period)
                .latest(bars)
                .map(|atr| atr * self.config.atr_multiplier)
                .filter(|size| *size > 0.0),
        }
    }

    /// Pattern completed by brick `k`, with the prior trend length behind it.
    fn pattern_at(&self, bricks: &[Brick], k: usize) -> Option<(Pattern, i8, i64)> {
        let brick = bricks[k];
        let dir = brick.direction as i64;
        let min_trend = self.config.min_trend_bricks as i64;

        let reversal = self.config.reversal_bricks;
        if brick.trend == reversal as i64 * dir && k >= reversal {
            let prior = bricks[k - reversal].trend;
            if prior.signum() == -dir && prior.abs() >= min_trend {
                return Some((Pattern::Reversal, brick.direction, prior.abs()));
            }
        }

        if k >= 2 && brick.trend == dir {
            let (before, pullback) = (bricks[k - 2].trend, bricks[k - 1].trend);
            if pullback == -dir && before.signum() == dir && before.abs() >= min_trend {
                return Some((Pattern::Pullback, brick.direction, before.abs()));
            }
        }

        let continuation = self.config.continuation_bricks as i64;
        if brick.trend == continuation * dir {
            return Some((Pattern::Continuation, brick.direction, continuation));
        }
        None
    }

    fn replay(&self, symbol: &str, timeframe: Timeframe, bars: &[Bar], size: f64) -> (Vec<Signal>, Vec<Brick>) {
        let bricks = build_bricks(bars, size);
        let mut signals = Vec::new();

        let mut k = 0;
        while k < bricks.len() {
            let bar_index = bricks[k].bar_index;
            // Last pattern completed on this bar wins
            let mut found = None;
            while k < bricks.len() && bricks[k].bar_index == bar_index {
                if let Some(pattern) = self.pattern_at(&bricks, k) {
                    found = Some(pattern);
                }
                k += 1;
            }

            let Some((pattern, direction, prior)) = found else {
                continue;
            };
            let bar = &bars[bar_index];
            let (signal_type, sign) = if direction > 0 {
                (SignalType::Buy, 1.0)
            } else {
                (SignalType::Sell, -1.0)
            };
            let confidence = (pattern.base_confidence() + (prior as f64 / 10.0).min(0.5)).min(1.0);

            signals.push(
                Signal::new(symbol, signal_type, bar.close, bar.timestamp, confidence, self.name(), timeframe)
                    .with_stop_loss(bar.close - sign * 2.0 * size)
                    .with_target(bar.close + sign * 3.0 * size)
                    .with_indicator("brick_size", size)
                    .with_indicator("prior_trend", prior as f64)
                    .with_reason(format!("Renko {} after {} bricks", pattern.as_str(), prior)),
            );
        }
        (signals, bricks)
    }
}

impl SignalGenerator for RenkoStrategy {
    fn name(&self) -> &str {
        "renko"
    }

    fn description(&self) -> &str {
        "Renko brick reversals, continuations and pullbacks"
    }

    fn update_data(&mut self, symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> usize {
        self.history.update(symbol, timeframe, bars)
    }

    fn generate_signals(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Vec<Signal>, StrategyError> {
        let bars = self
            .history
            .bars(symbol, timeframe)
            .ok_or_else(|| StrategyError::NoHistory {
                symbol: symbol.to_string(),
                timeframe: timeframe.to_string(),
            })?;
        if bars.len() < self.warmup_period() {
            return Ok(Vec::new());
        }
        let Some(size) = self.brick_size(&bars) else {
            return Ok(Vec::new());
        };

        let (signals, bricks) = self.replay(symbol, timeframe, &bars, size);
        self.last_trend = bricks.last().map_or(0, |b| b.trend);
        self.indicators.clear();
        self.indicators.insert("brick_size".to_string(), size);
        self.indicators.insert("bricks".to_string(), bricks.len() as f64);
        self.indicators.insert("trend".to_string(), self.last_trend as f64);

        let signals = recent_signals(signals, &bars, self.config.signal_window);
        self.signals_generated += signals.len();
        Ok(signals)
    }

    fn reset(&mut self) {
        self.history.clear();
        self.signals_generated = 0;
        self.last_trend = 0;
        self.indicators.clear();
    }

    fn state(&self) -> StrategyState {
        StrategyState {
            name: self.name().to_string(),
            is_warmed_up: self.is_warmed_up(self.history.longest()),
            bars_processed: self.history.total_bars(),
            signals_generated: self.signals_generated,
            indicators: self.indicators.clone(),
            custom: serde_json::json!({ "trend": self.last_trend }),
        }
    }

    fn warmup_period(&self) -> usize {
        match self.config.brick_size {
            Some(_) => 2,
            None => self.config.atr_period + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar::new(i as i64 * 60_000, c, c + 0.5, c - 0.5, c, 100.0))
            .collect()
    }

    fn fixed(size: f64) -> RenkoStrategy {
        RenkoStrategy::new(RenkoConfig {
            brick_size: Some(size),
            signal_window: 0,
            ..Default::default()
        })
    }

    fn run(strategy: &mut RenkoStrategy, closes: &[f64]) -> Vec<Signal> {
        strategy.update_data("ETHUSDT", Timeframe::Minute5, &bars_from_closes(closes));
        strategy.generate_signals("ETHUSDT", Timeframe::Minute5).unwrap()
    }

    #[test]
    fn test_monotonic_rise_has_increasing_trend() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let bricks = build_bricks(&bars_from_closes(&closes), 1.0);

        assert_eq!(bricks.len(), 39);
        assert!(bricks.iter().all(|b| b.direction == 1));
        assert!(bricks.windows(2).all(|w| w[1].trend > w[0].trend));

        let signals = run(&mut fixed(1.0), &closes);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::Buy);
        assert!(signals[0].metadata.reason.contains("continuation"));
    }

    #[test]
    fn test_large_move_builds_several_bricks() {
        let bricks = build_bricks(&bars_from_closes(&[100.0, 103.5, 101.5]), 1.0);
        assert_eq!(bricks.len(), 4);
        assert_eq!(bricks[2].trend, 3);
        assert_eq!(bricks[3].direction, -1);
        assert_eq!(bricks[3].trend, -1);
        assert_eq!(bricks[3].close, 102.0);
    }

    #[test]
    fn test_brick_below_price_resolution_ends() {
        let bricks = build_bricks(&bars_from_closes(&[1e6, 1e6 + 1.0, 1e6 - 1.0]), 1e-12);
        assert!(bricks.is_empty());
    }

    #[test]
    fn test_bricks_per_bar_are_capped() {
        let bricks = build_bricks(&bars_from_closes(&[100.0, 200.0]), 1e-3);
        assert_eq!(bricks.len(), MAX_BRICKS_PER_BAR);
        assert!(bricks.iter().all(|b| b.direction == 1 && b.bar_index == 1));
    }

    #[test]
    fn test_reversal_after_trend() {
        let signals = run(&mut fixed(1.0), &[100.0, 101.0, 102.0, 103.0, 104.0, 105.0, 104.0, 103.0]);

        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].signal_type, SignalType::Buy);
        let sell = &signals[1];
        assert_eq!(sell.signal_type, SignalType::Sell);
        assert_eq!(sell.price, 103.0);
        assert_eq!(sell.metadata.stop_loss, Some(105.0));
        assert_eq!(sell.metadata.target_price, Some(100.0));
        // Prior trend of five bricks adds 0.5 to the reversal base
        assert!((sell.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_pullback_resume() {
        let signals = run(&mut fixed(1.0), &[100.0, 101.0, 102.0, 103.0, 104.0, 105.0, 104.0, 105.0]);

        let last = signals.last().unwrap();
        assert_eq!(last.signal_type, SignalType::Buy);
        assert_eq!(last.timestamp, 7 * 60_000);
        assert!(last.metadata.reason.contains("pullback"));
    }

    #[test]
    fn test_atr_brick_size_needs_history() {
        let mut strategy = RenkoStrategy::new(RenkoConfig {
            signal_window: 0,
            ..Default::default()
        });
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        assert!(run(&mut strategy, &closes).is_empty());
        assert!(!strategy.state().is_warmed_up);
    }

    #[test]
    fn test_invalid_brick_size_rejected() {
        let config = RenkoConfig {
            brick_size: Some(0.0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

//! Darvas Box consolidation-breakout strategy.
//!
//! A box forms when a local high is followed by `consolidation_bars` bars
//! that stay beneath it. The box is confirmed as soon as the consolidation
//! completes, and is traded when closes leave it: above the top for a BUY,
//! below the bottom for a SELL. The box height is projected as the target
//! and the opposite edge becomes the stop.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use trading_core::traits::BarIndicator;
use trading_core::{
    error::StrategyError,
    traits::{SignalGenerator, StrategyConfig, StrategyState},
    types::{Bar, Signal, SignalType, Timeframe},
};
use trading_indicators::{rolling_mean, Atr};

use crate::history::{recent_signals, CandleStore};

/// Configuration for the Darvas Box strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DarvasConfig {
    /// Prior bars the local high must equal or exceed
    pub high_lookback: usize,
    /// Bars that must stay below the high to form a box
    pub consolidation_bars: usize,
    /// Minimum box height as a fraction of the top
    pub min_box_pct: f64,
    pub atr_period: usize,
    /// Minimum box height in ATRs
    pub atr_multiplier: f64,
    /// Consecutive closes outside the box needed to confirm a breakout
    pub breakout_bars: usize,
    pub volume_confirmation: bool,
    /// Breakout volume must reach this multiple of the average volume
    pub volume_factor: f64,
    pub volume_period: usize,
    /// Emit signals from the last N bars only (0 = whole history)
    pub signal_window: usize,
}

impl Default for DarvasConfig {
    fn default() -> Self {
        Self {
            high_lookback: 10,
            consolidation_bars: 3,
            min_box_pct: 0.01,
            atr_period: 14,
            atr_multiplier: 0.5,
            breakout_bars: 1,
            volume_confirmation: false,
            volume_factor: 1.5,
            volume_period: 20,
            signal_window: 1,
        }
    }
}

impl StrategyConfig for DarvasConfig {
    fn validate(&self) -> Result<(), StrategyError> {
        if self.high_lookback == 0 || self.consolidation_bars == 0 {
            return Err(StrategyError::InvalidConfig(
                "high_lookback and consolidation_bars must be greater than 0".into(),
            ));
        }
        if self.breakout_bars == 0 {
            return Err(StrategyError::InvalidConfig(
                "breakout_bars must be greater than 0".into(),
            ));
        }
        if self.min_box_pct < 0.0 || self.atr_multiplier < 0.0 {
            return Err(StrategyError::InvalidConfig(
                "Box height limits cannot be negative".into(),
            ));
        }
        if self.atr_period == 0 || self.volume_period == 0 {
            return Err(StrategyError::InvalidConfig(
                "atr_period and volume_period must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// A confirmed consolidation range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DarvasBox {
    pub top: f64,
    pub bottom: f64,
    /// Timestamp of the bar that completed the consolidation
    pub confirmed_at: i64,
}

impl DarvasBox {
    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Searching,
    Active {
        range: DarvasBox,
        above: usize,
        below: usize,
    },
}

/// Darvas Box strategy.
pub struct DarvasBoxStrategy {
    config: DarvasConfig,
    history: CandleStore,
    signals_generated: usize,
    active_box: Option<DarvasBox>,
    indicators: HashMap<String, f64>,
}

impl DarvasBoxStrategy {
    pub fn new(config: DarvasConfig) -> Self {
        Self {
            config,
            history: CandleStore::new(0),
            signals_generated: 0,
            active_box: None,
            indicators: HashMap::new(),
        }
    }

    /// Try to confirm a box whose consolidation ends at bar `i`.
    fn detect_box(&self, bars: &[Bar], i: usize, atr: &[Option<f64>]) -> Option<DarvasBox> {
        let n = self.config.consolidation_bars;
        let j = i.checked_sub(n)?;
        if j < self.config.high_lookback {
            return None;
        }

        let top = bars[j].high;
        let prior_high = bars[j - self.config.high_lookback..j]
            .iter()
            .map(|b| b.high)
            .fold(f64::MIN, f64::max);
        if top < prior_high {
            return None;
        }

        let consolidation = &bars[j + 1..=i];
        if consolidation.iter().any(|b| b.high >= top) {
            return None;
        }
        let bottom = consolidation
            .iter()
            .map(|b| b.low)
            .fold(f64::MAX, f64::min);

        let required = (self.config.min_box_pct * top)
            .max(atr[i].map_or(0.0, |a| a * self.config.atr_multiplier));
        if top - bottom < required {
            return None;
        }

        Some(DarvasBox {
            top,
            bottom,
            confirmed_at: bars[i].timestamp,
        })
    }

    fn replay(&self, symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> (Vec<Signal>, Option<DarvasBox>) {
        let atr = Atr::new(self.config.atr_period).calculate_bars(bars);
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
        let volume_mean = rolling_mean(&volumes, self.config.volume_period);

        let mut signals = Vec::new();
        let mut phase = Phase::Searching;

        for (i, bar) in bars.iter().enumerate() {
            match phase {
                Phase::Searching => {
                    if let Some(range) = self.detect_box(bars, i, &atr) {
                        phase = Phase::Active {
                            range,
                            above: 0,
                            below: 0,
                        };
                    }
                }
                Phase::Active {
                    range,
                    mut above,
                    mut below,
                } => {
                    if bar.close > range.top {
                        above += 1;
                        below = 0;
                    } else if bar.close < range.bottom {
                        below += 1;
                        above = 0;
                    } else {
                        above = 0;
                        below = 0;
                    }

                    let direction = if above >= self.config.breakout_bars {
                        Some(SignalType::Buy)
                    } else if below >= self.config.breakout_bars {
                        Some(SignalType::Sell)
                    } else {
                        None
                    };

                    phase = match direction {
                        None => Phase::Active { range, above, below },
                        Some(signal_type) => {
                            let volume_ok = !self.config.volume_confirmation
                                || i.checked_sub(1)
                                    .and_then(|p| volume_mean[p])
                                    .is_some_and(|mean| bar.volume >= mean * self.config.volume_factor);
                            if volume_ok {
                                signals.push(self.breakout_signal(symbol, timeframe, bar, &range, signal_type));
                            }
                            // Box is spent either way; a failed breakout without
                            // volume is not traded later.
                            Phase::Searching
                        }
                    };
                }
            }
        }

        let active = match phase {
            Phase::Active { range, .. } => Some(range),
            Phase::Searching => None,
        };
        (signals, active)
    }

    fn breakout_signal(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bar: &Bar,
        range: &DarvasBox,
        signal_type: SignalType,
    ) -> Signal {
        let height = range.height();
        let (stop, target, edge) = match signal_type {
            SignalType::Buy => (range.bottom, range.top + height, range.top),
            _ => (range.top, range.bottom - height, range.bottom),
        };
        // Stronger when the close clears the edge by a larger share of the box
        let penetration = ((bar.close - edge).abs() / height).min(1.0);
        let confidence = (0.6 + 0.3 * penetration).min(1.0);

        Signal::new(symbol, signal_type, bar.close, bar.timestamp, confidence, self.name(), timeframe)
            .with_stop_loss(stop)
            .with_target(target)
            .with_indicator("box_top", range.top)
            .with_indicator("box_bottom", range.bottom)
            .with_indicator("box_height", height)
            .with_reason(format!(
                "Close {:.4} broke box [{:.4}, {:.4}]",
                bar.close, range.bottom, range.top
            ))
    }
}

impl SignalGenerator for DarvasBoxStrategy {
    fn name(&self) -> &str {
        "darvas_box"
    }

    fn description(&self) -> &str {
        "Darvas Box consolidation breakouts with ATR-scaled minimum box height"
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

        let (signals, active) = self.replay(symbol, timeframe, &bars);
        self.active_box = active;
        self.indicators.clear();
        if let Some(range) = active {
            self.indicators.insert("box_top".to_string(), range.top);
            self.indicators.insert("box_bottom".to_string(), range.bottom);
        }

        let signals = recent_signals(signals, &bars, self.config.signal_window);
        self.signals_generated += signals.len();
        Ok(signals)
    }

    fn reset(&mut self) {
        self.history.clear();
        self.signals_generated = 0;
        self.active_box = None;
        self.indicators.clear();
    }

    fn state(&self) -> StrategyState {
        StrategyState {
            name: self.name().to_string(),
            is_warmed_up: self.is_warmed_up(self.history.longest()),
            bars_processed: self.history.total_bars(),
            signals_generated: self.signals_generated,
            indicators: self.indicators.clone(),
            custom: serde_json::json!({ "active_box": self.active_box }),
        }
    }

    fn warmup_period(&self) -> usize {
        self.config.high_lookback + self.config.consolidation_bars + 1
    }
}

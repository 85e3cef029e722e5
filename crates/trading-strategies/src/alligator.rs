//! Williams Alligator trend-channel strategy.
//!
//! Three smoothed moving averages of the median price, each shifted
//! forward in time:
//! - jaw: SMMA(13) shifted 8 bars
//! - teeth: SMMA(8) shifted 5 bars
//! - lips: SMMA(5) shifted 3 bars
//!
//! Their ordering and spread classify the market. Entries fire on
//! awakening/eating states backed by enough confirmations; exits fire when
//! the close crosses back through the teeth while the alligator sleeps or
//! is sated.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use trading_core::traits::{BarIndicator, Indicator};
use trading_core::{
    error::StrategyError,
    traits::{SignalGenerator, StrategyConfig, StrategyState},
    types::{Bar, Signal, SignalType, Timeframe},
};
use trading_indicators::{
    pad_front, rolling_mean, shift_forward, AcceleratorOscillator, AwesomeOscillator, Fractals,
    Smma,
};

use crate::history::{recent_signals, CandleStore};

/// Market phase read from the alligator lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlligatorState {
    /// Lines intertwined, no trend
    Sleeping,
    AwakeningBullish,
    AwakeningBearish,
    /// Ordered and spreading apart
    EatingBullish,
    EatingBearish,
    /// Ordered but converging
    SatedBullish,
    SatedBearish,
    Transition,
}

impl AlligatorState {
    fn is_bullish_entry(&self) -> bool {
        matches!(self, AlligatorState::AwakeningBullish | AlligatorState::EatingBullish)
    }

    fn is_bearish_entry(&self) -> bool {
        matches!(self, AlligatorState::AwakeningBearish | AlligatorState::EatingBearish)
    }

    fn allows_exit(&self) -> bool {
        matches!(
            self,
            AlligatorState::Sleeping | AlligatorState::SatedBullish | AlligatorState::SatedBearish
        )
    }

    fn is_eating(&self) -> bool {
        matches!(self, AlligatorState::EatingBullish | AlligatorState::EatingBearish)
    }
}

/// Configuration for the Alligator strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlligatorConfig {
    pub jaw_period: usize,
    pub jaw_shift: usize,
    pub teeth_period: usize,
    pub teeth_shift: usize,
    pub lips_period: usize,
    pub lips_shift: usize,
    /// Line spread (as a fraction of the teeth) below which the alligator sleeps
    pub sleep_threshold: f64,
    /// Bars of fresh ordering still counted as "awakening"
    pub awakening_bars: usize,
    /// Confirmations required out of AO, AC, fractal and volume
    pub min_confirmations: usize,
    /// Bars to look back for a confirmed fractal
    pub fractal_lookback: usize,
    pub volume_period: usize,
    /// Emit signals from the last N bars only (0 = whole history)
    pub signal_window: usize,
}

impl Default for AlligatorConfig {
    fn default() -> Self {
        Self {
            jaw_period: 13,
            jaw_shift: 8,
            teeth_period: 8,
            teeth_shift: 5,
            lips_period: 5,
            lips_shift: 3,
            sleep_threshold: 0.002,
            awakening_bars: 3,
            min_confirmations: 2,
            fractal_lookback: 5,
            volume_period: 20,
            signal_window: 1,
        }
    }
}

impl StrategyConfig for AlligatorConfig {
    fn validate(&self) -> Result<(), StrategyError> {
        if self.jaw_period == 0 || self.teeth_period == 0 || self.lips_period == 0 {
            return Err(StrategyError::InvalidConfig(
                "Alligator periods must be greater than 0".into(),
            ));
        }
        if !(self.lips_period < self.teeth_period && self.teeth_period < self.jaw_period) {
            return Err(StrategyError::InvalidConfig(
                "Alligator periods must satisfy lips < teeth < jaw".into(),
            ));
        }
        if self.min_confirmations > 4 {
            return Err(StrategyError::InvalidConfig(
                "min_confirmations cannot exceed 4".into(),
            ));
        }
        if self.sleep_threshold < 0.0 || self.volume_period == 0 {
            return Err(StrategyError::InvalidConfig(
                "sleep_threshold must be >= 0 and volume_period > 0".into(),
            ));
        }
        Ok(())
    }
}

struct Lines {
    jaw: Vec<Option<f64>>,
    teeth: Vec<Option<f64>>,
    lips: Vec<Option<f64>>,
}

impl Lines {
    fn at(&self, i: usize) -> Option<(f64, f64, f64)> {
        Some((self.jaw[i]?, self.teeth[i]?, self.lips[i]?))
    }
}

/// Williams Alligator strategy.
pub struct AlligatorStrategy {
    config: AlligatorConfig,
    history: CandleStore,
    signals_generated: usize,
    last_state: Option<AlligatorState>,
    indicators: HashMap<String, f64>,
}

impl AlligatorStrategy {
    pub fn new(config: AlligatorConfig) -> Self {
        Self {
            config,
            history: CandleStore::new(0),
            signals_generated: 0,
            last_state: None,
            indicators: HashMap::new(),
        }
    }

    fn line(median: &[f64], period: usize, shift: usize) -> Vec<Option<f64>> {
        let smma = pad_front(Smma::new(period).calculate(median), median.len());
        shift_forward(&smma, shift)
    }

    fn lines(&self, bars: &[Bar]) -> Lines {
        let median: Vec<f64> = bars.iter().map(|b| b.median_price()).collect();
        Lines {
            jaw: Self::line(&median, self.config.jaw_period, self.config.jaw_shift),
            teeth: Self::line(&median, self.config.teeth_period, self.config.teeth_shift),
            lips: Self::line(&median, self.config.lips_period, self.config.lips_shift),
        }
    }

    /// Classify every bar of a history. `None` until all three lines exist.
    pub fn classify(&self, bars: &[Bar]) -> Vec<Option<AlligatorState>> {
        let lines = self.lines(bars);
        self.classify_lines(bars, &lines)
    }

    fn classify_lines(&self, bars: &[Bar], lines: &Lines) -> Vec<Option<AlligatorState>> {
        let mut states = Vec::with_capacity(bars.len());
        let mut prev_spread: Option<f64> = None;
        let (mut bull_run, mut bear_run) = (0usize, 0usize);

        for i in 0..bars.len() {
            let Some((jaw, teeth, lips)) = lines.at(i) else {
                states.push(None);
                continue;
            };

            let spread = (jaw.max(teeth).max(lips) - jaw.min(teeth).min(lips)) / teeth;
            let bullish = lips > teeth && teeth > jaw;
            let bearish = lips < teeth && teeth < jaw;
            let expanding = prev_spread.is_some_and(|p| spread > p);
            prev_spread = Some(spread);

            let state = if spread < self.config.sleep_threshold {
                bull_run = 0;
                bear_run = 0;
                AlligatorState::Sleeping
            } else if bullish {
                bull_run += 1;
                bear_run = 0;
                if bull_run <= self.config.awakening_bars {
                    AlligatorState::AwakeningBullish
                } else if expanding {
                    AlligatorState::EatingBullish
                } else {
                    AlligatorState::SatedBullish
                }
            } else if bearish {
                bear_run += 1;
                bull_run = 0;
                if bear_run <= self.config.awakening_bars {
                    AlligatorState::AwakeningBearish
                } else if expanding {
                    AlligatorState::EatingBearish
                } else {
                    AlligatorState::SatedBearish
                }
            } else {
                bull_run = 0;
                bear_run = 0;
                AlligatorState::Transition
            };
            states.push(Some(state));
        }
        states
    }

    fn replay(&self, symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> Replay {
        let lines = self.lines(bars);
        let states = self.classify_lines(bars, &lines);
        let ao = AwesomeOscillator::new().calculate_bars(bars);
        let ac = AcceleratorOscillator::new().calculate_bars(bars);
        let fractals_detector = Fractals::new();
        let fractals = fractals_detector.calculate_bars(bars);
        let span = fractals_detector.period() / 2;
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
        let volume_mean = rolling_mean(&volumes, self.config.volume_period);

        let rising = |series: &[Option<f64>], i: usize, bullish: bool| match (series[i], series[i - 1]) {
            (Some(now), Some(prev)) if bullish => now > prev,
            (Some(now), Some(prev)) => now < prev,
            _ => false,
        };

        let confirmations = |i: usize, bullish: bool| -> usize {
            let ao_ok = rising(&ao, i, bullish);
            let ac_ok = rising(&ac, i, bullish);
            // Only fractals whose right-hand bars are already known
            let fractal_ok = i >= span && {
                let last = i - span;
                let first = last.saturating_sub(self.config.fractal_lookback);
                fractals[first..=last]
                    .iter()
                    .flatten()
                    .any(|f| if bullish { f.up } else { f.down })
            };
            let volume_ok = volume_mean[i - 1].is_some_and(|mean| bars[i].volume > mean);
            [ao_ok, ac_ok, fractal_ok, volume_ok].iter().filter(|ok| **ok).count()
        };

        let mut signals = Vec::new();
        let mut position = 0i8;

        for i in 1..bars.len() {
            let (Some(state), Some((jaw, teeth, lips))) = (states[i], lines.at(i)) else {
                continue;
            };
            let bar = &bars[i];

            let entry = if state.is_bullish_entry() && position != 1 {
                Some((SignalType::Buy, true))
            } else if state.is_bearish_entry() && position != -1 {
                Some((SignalType::Sell, false))
            } else {
                None
            };

            if let Some((signal_type, bullish)) = entry {
                let count = confirmations(i, bullish);
                if count >= self.config.min_confirmations {
                    let mut confidence = 0.5 + 0.1 * count as f64;
                    if state.is_eating() {
                        confidence += 0.1;
                    }
                    let risk = (bar.close - jaw).abs();
                    let target = if bullish {
                        bar.close + 2.0 * risk
                    } else {
                        bar.close - 2.0 * risk
                    };
                    signals.push(
                        Signal::new(symbol, signal_type, bar.close, bar.timestamp, confidence.min(1.0), self.name(), timeframe)
                            .with_stop_loss(jaw)
                            .with_target(target)
                            .with_indicator("jaw", jaw)
                            .with_indicator("teeth", teeth)
                            .with_indicator("lips", lips)
                            .with_indicator("confirmations", count as f64)
                            .with_reason(format!("{:?} with {} confirmations", state, count)),
                    );
                    position = if bullish { 1 } else { -1 };
                }
                continue;
            }

            if !state.allows_exit() {
                continue;
            }
            let Some(prev_teeth) = lines.teeth[i - 1] else {
                continue;
            };
            let prev_close = bars[i - 1].close;
            let exit = if position == 1 && bar.close < teeth && prev_close >= prev_teeth {
                Some(SignalType::ExitBuy)
            } else if position == -1 && bar.close > teeth && prev_close <= prev_teeth {
                Some(SignalType::ExitSell)
            } else {
                None
            };
            if let Some(signal_type) = exit {
                signals.push(
                    Signal::new(symbol, signal_type, bar.close, bar.timestamp, 0.7, self.name(), timeframe)
                        .with_indicator("teeth", teeth)
                        .with_reason(format!("Close crossed teeth while {:?}", state)),
                );
                position = 0;
            }
        }

        let last = bars.len().saturating_sub(1);
        let mut indicators = HashMap::new();
        if let Some((jaw, teeth, lips)) = lines.at(last) {
            indicators.insert("jaw".to_string(), jaw);
            indicators.insert("teeth".to_string(), teeth);
            indicators.insert("lips".to_string(), lips);
        }
        if let Some(Some(value)) = ao.get(last) {
            indicators.insert("ao".to_string(), *value);
        }

        Replay {
            signals,
            last_state: states.last().copied().flatten(),
            indicators,
        }
    }
}

struct Replay {
    signals: Vec<Signal>,
    last_state: Option<AlligatorState>,
    indicators: HashMap<String, f64>,
}

impl SignalGenerator for AlligatorStrategy {
    fn name(&self) -> &str {
        "alligator"
    }

    fn description(&self) -> &str {
        "Williams Alligator trend-channel entries with AO/AC/fractal/volume confirmation"
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

        let replay = self.replay(symbol, timeframe, &bars);
        self.last_state = replay.last_state;
        self.indicators = replay.indicators;

        let signals = recent_signals(replay.signals, &bars, self.config.signal_window);
        self.signals_generated += signals.len();
        Ok(signals)
    }

    fn reset(&mut self) {
        self.history.clear();
        self.signals_generated = 0;
        self.last_state = None;
        self.indicators.clear();
    }

    fn state(&self) -> StrategyState {
        StrategyState {
            name: self.name().to_string(),
            is_warmed_up: self.is_warmed_up(self.history.longest()),
            bars_processed: self.history.total_bars(),
            signals_generated: self.signals_generated,
            indicators: self.indicators.clone(),
            custom: serde_json::json!({ "alligator_state": self.last_state }),
        }
    }

    fn warmup_period(&self) -> usize {
        (self.config.jaw_period + self.config.jaw_shift).max(self.config.volume_period + 1)
    }
}

//! Ichimoku cloud strategy.
//!
//! Tenkan/Kijun crossovers are traded only on the side of the displaced
//! Senkou cloud they point to, and only when the lagging close (Chikou)
//! agrees. Positions are exited once the close falls back into the cloud.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use trading_core::traits::BarIndicator;
use trading_core::{
    error::StrategyError,
    traits::{SignalGenerator, StrategyConfig, StrategyState},
    types::{Bar, Signal, SignalType, Timeframe},
};
use trading_indicators::{shift_forward, DonchianMidpoint};

use crate::history::{recent_signals, CandleStore};

/// Configuration for the Ichimoku strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IchimokuConfig {
    pub tenkan_period: usize,
    pub kijun_period: usize,
    pub senkou_b_period: usize,
    /// Forward shift of the cloud and backward shift of the Chikou span
    pub displacement: usize,
    /// Emit signals from the last N bars only (0 = whole history)
    pub signal_window: usize,
}

impl Default for IchimokuConfig {
    fn default() -> Self {
        Self {
            tenkan_period: 9,
            kijun_period: 26,
            senkou_b_period: 52,
            displacement: 26,
            signal_window: 1,
        }
    }
}

impl StrategyConfig for IchimokuConfig {
    fn validate(&self) -> Result<(), StrategyError> {
        if self.tenkan_period == 0 || self.displacement == 0 {
            return Err(StrategyError::InvalidConfig(
                "tenkan_period and displacement must be greater than 0".into(),
            ));
        }
        if !(self.tenkan_period < self.kijun_period && self.kijun_period < self.senkou_b_period) {
            return Err(StrategyError::InvalidConfig(
                "Periods must satisfy tenkan < kijun < senkou_b".into(),
            ));
        }
        Ok(())
    }
}

/// Ichimoku lines aligned with the input bars.
#[derive(Debug, Clone)]
pub struct IchimokuLines {
    pub tenkan: Vec<Option<f64>>,
    pub kijun: Vec<Option<f64>>,
    /// Leading span A as drawn at each bar (already displaced)
    pub senkou_a: Vec<Option<f64>>,
    /// Leading span B as drawn at each bar (already displaced)
    pub senkou_b: Vec<Option<f64>>,
}

impl IchimokuLines {
    /// (bottom, top) of the cloud at bar `i`.
    pub fn cloud(&self, i: usize) -> Option<(f64, f64)> {
        let (a, b) = (self.senkou_a[i]?, self.senkou_b[i]?);
        Some((a.min(b), a.max(b)))
    }
}

/// Ichimoku cloud strategy.
pub struct IchimokuStrategy {
    config: IchimokuConfig,
    history: CandleStore,
    signals_generated: usize,
    indicators: HashMap<String, f64>,
}

impl IchimokuStrategy {
    pub fn new(config: IchimokuConfig) -> Self {
        Self {
            config,
            history: CandleStore::new(0),
            signals_generated: 0,
            indicators: HashMap::new(),
        }
    }

    pub fn lines(&self, bars: &[Bar]) -> IchimokuLines {
        let tenkan = DonchianMidpoint::new(self.config.tenkan_period).calculate_bars(bars);
        let kijun = DonchianMidpoint::new(self.config.kijun_period).calculate_bars(bars);
        let raw_a: Vec<Option<f64>> = tenkan
            .iter()
            .zip(&kijun)
            .map(|(t, k)| Some((t.as_ref()? + k.as_ref()?) / 2.0))
            .collect();
        let raw_b = DonchianMidpoint::new(self.config.senkou_b_period).calculate_bars(bars);

        IchimokuLines {
            senkou_a: shift_forward(&raw_a, self.config.displacement),
            senkou_b: shift_forward(&raw_b, self.config.displacement),
            tenkan,
            kijun,
        }
    }

    fn replay(&self, symbol: &str, timeframe: Timeframe, bars: &[Bar], lines: &IchimokuLines) -> Vec<Signal> {
        let lag = self.config.displacement;
        let mut signals = Vec::new();
        let mut position = 0i8;

        for i in lag.max(1)..bars.len() {
            let (Some(tenkan), Some(kijun), Some(prev_tenkan), Some(prev_kijun), Some((bottom, top))) = (
                lines.tenkan[i],
                lines.kijun[i],
                lines.tenkan[i - 1],
                lines.kijun[i - 1],
                lines.cloud(i),
            ) else {
                continue;
            };
            let bar = &bars[i];
            let chikou_ref = bars[i - lag].close;

            let bull_cross = tenkan > kijun && prev_tenkan <= prev_kijun;
            let bear_cross = tenkan < kijun && prev_tenkan >= prev_kijun;

            let entry = if bull_cross && position != 1 && bar.close > top && bar.close > chikou_ref {
                Some((SignalType::Buy, 1.0, top))
            } else if bear_cross && position != -1 && bar.close < bottom && bar.close < chikou_ref {
                Some((SignalType::Sell, -1.0, bottom))
            } else {
                None
            };

            if let Some((signal_type, sign, edge)) = entry {
                let mut confidence: f64 = 0.6;
                // Both lines on the trade side of the cloud
                if sign * (tenkan - edge) > 0.0 && sign * (kijun - edge) > 0.0 {
                    confidence += 0.1;
                }
                // Cloud colour agrees
                if let (Some(a), Some(b)) = (lines.senkou_a[i], lines.senkou_b[i]) {
                    if sign * (a - b) > 0.0 {
                        confidence += 0.1;
                    }
                }
                let risk = (bar.close - kijun).abs();
                signals.push(
                    Signal::new(symbol, signal_type, bar.close, bar.timestamp, confidence.min(1.0), self.name(), timeframe)
                        .with_stop_loss(kijun)
                        .with_target(bar.close + sign * 2.0 * risk)
                        .with_indicator("tenkan", tenkan)
                        .with_indicator("kijun", kijun)
                        .with_indicator("cloud_top", top)
                        .with_indicator("cloud_bottom", bottom)
                        .with_reason(format!("TK cross {} the cloud", if sign > 0.0 { "above" } else { "below" })),
                );
                position = if sign > 0.0 { 1 } else { -1 };
                continue;
            }

            let exit = if position == 1 && bar.close <= top {
                Some(SignalType::ExitBuy)
            } else if position == -1 && bar.close >= bottom {
                Some(SignalType::ExitSell)
            } else {
                None
            };
            if let Some(signal_type) = exit {
                signals.push(
                    Signal::new(symbol, signal_type, bar.close, bar.timestamp, 0.7, self.name(), timeframe)
                        .with_indicator("cloud_top", top)
                        .with_indicator("cloud_bottom", bottom)
                        .with_reason("Close re-entered the cloud"),
                );
                position = 0;
            }
        }
        signals
    }
}

impl SignalGenerator for IchimokuStrategy {
    fn name(&self) -> &str {
        "ichimoku"
    }

    fn description(&self) -> &str {
        "Ichimoku Tenkan/Kijun crosses filtered by the cloud and Chikou span"
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

        let lines = self.lines(&bars);
        let signals = self.replay(symbol, timeframe, &bars, &lines);

        let last = bars.len() - 1;
        self.indicators.clear();
        for (name, series) in [
            ("tenkan", &lines.tenkan),
            ("kijun", &lines.kijun),
            ("senkou_a", &lines.senkou_a),
            ("senkou_b", &lines.senkou_b),
        ] {
            if let Some(value) = series[last] {
                self.indicators.insert(name.to_string(), value);
            }
        }

        let signals = recent_signals(signals, &bars, self.config.signal_window);
        self.signals_generated += signals.len();
        Ok(signals)
    }

    fn reset(&mut self) {
        self.history.clear();
        self.signals_generated = 0;
        self.indicators.clear();
    }

    fn state(&self) -> StrategyState {
        StrategyState {
            name: self.name().to_string(),
            is_warmed_up: self.is_warmed_up(self.history.longest()),
            bars_processed: self.history.total_bars(),
            signals_generated: self.signals_generated,
            indicators: self.indicators.clone(),
            custom: serde_json::Value::Null,
        }
    }

    fn warmup_period(&self) -> usize {
        self.config.senkou_b_period + self.config.displacement
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(i: usize, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar::new(i as i64 * 3_600_000, open, high, low, close, 1000.0)
    }

    /// Flat market at 100 with a spike and a dip that keep the Kijun above
    /// the Tenkan, followed by a breakout bar at index 80.
    fn breakout_series() -> Vec<Bar> {
        let mut bars: Vec<Bar> = (0..80)
            .map(|i| match i {
                60 => bar(i, 100.0, 110.0, 99.0, 100.0),
                65 => bar(i, 100.0, 101.0, 95.0, 100.0),
                _ => bar(i, 100.0, 101.0, 99.0, 100.0),
            })
            .collect();
        bars.push(bar(80, 116.0, 120.0, 116.0, 118.0));
        bars
    }

    fn whole_history() -> IchimokuStrategy {
        IchimokuStrategy::new(IchimokuConfig {
            signal_window: 0,
            ..Default::default()
        })
    }

    #[test]
    fn test_lines_are_displaced() {
        let strategy = whole_history();
        let bars = breakout_series();
        let lines = strategy.lines(&bars);

        assert!(lines.senkou_b[76].is_none());
        assert_eq!(lines.senkou_b[77], Some(100.0));
        assert_eq!(lines.tenkan[79], Some(100.0));
        assert_eq!(lines.kijun[79], Some(102.5));
        assert_eq!(lines.cloud(80), Some((100.0, 100.0)));
    }

    #[test]
    fn test_buy_on_cross_above_cloud() {
        let mut strategy = whole_history();
        strategy.update_data("BTCUSDT", Timeframe::Hour1, &breakout_series());
        let signals = strategy.generate_signals("BTCUSDT", Timeframe::Hour1).unwrap();

        assert_eq!(signals.len(), 1);
        let buy = &signals[0];
        assert_eq!(buy.signal_type, SignalType::Buy);
        assert_eq!(buy.price, 118.0);
        assert_eq!(buy.metadata.stop_loss, Some(107.5));
        assert_eq!(buy.metadata.target_price, Some(139.0));
    }

    #[test]
    fn test_exit_when_close_reenters_cloud() {
        let mut bars = breakout_series();
        bars.push(bar(81, 117.0, 118.0, 98.0, 99.0));

        let mut strategy = whole_history();
        strategy.update_data("BTCUSDT", Timeframe::Hour1, &bars);
        let signals = strategy.generate_signals("BTCUSDT", Timeframe::Hour1).unwrap();

        let types: Vec<SignalType> = signals.iter().map(|s| s.signal_type).collect();
        assert_eq!(types, vec![SignalType::Buy, SignalType::ExitBuy]);
    }

    #[test]
    fn test_short_history_is_quiet() {
        let mut strategy = whole_history();
        strategy.update_data("BTCUSDT", Timeframe::Hour1, &breakout_series()[..70]);
        assert!(strategy.generate_signals("BTCUSDT", Timeframe::Hour1).unwrap().is_empty());
        assert!(!strategy.state().is_warmed_up);
    }
}

//! Volatility and channel indicators.

use trading_core::traits::{BarIndicator, Indicator};
use trading_core::types::Bar;

/// Average True Range (ATR) with Wilder's smoothing.
#[derive(Debug, Clone)]
pub struct Atr {
    period: usize,
}

impl Atr {
    /// Common period is 14.
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "Period must be greater than 0");
        Self { period }
    }

    /// ATR from OHLC data. The first value belongs to input index `period`.
    pub fn calculate_ohlc(&self, high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
        let len = high.len().min(low.len()).min(close.len());
        if len < self.period + 1 {
            return vec![];
        }

        let tr: Vec<f64> = (1..len)
            .map(|i| {
                let high_low = high[i] - low[i];
                let high_close = (high[i] - close[i - 1]).abs();
                let low_close = (low[i] - close[i - 1]).abs();
                high_low.max(high_close).max(low_close)
            })
            .collect();

        let period_f64 = self.period as f64;
        let mut result = Vec::with_capacity(tr.len() - self.period + 1);

        let mut atr: f64 = tr[..self.period].iter().sum::<f64>() / period_f64;
        result.push(atr);

        for &tr_val in &tr[self.period..] {
            atr = (atr * (period_f64 - 1.0) + tr_val) / period_f64;
            result.push(atr);
        }

        result
    }

    /// Latest ATR value over the bars, if there is enough history.
    pub fn latest(&self, bars: &[Bar]) -> Option<f64> {
        let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        self.calculate_ohlc(&highs, &lows, &closes).last().copied()
    }
}

impl BarIndicator for Atr {
    type Output = f64;

    fn calculate_bars(&self, bars: &[Bar]) -> Vec<Option<f64>> {
        let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        crate::pad_front(self.calculate_ohlc(&highs, &lows, &closes), bars.len())
    }

    fn period(&self) -> usize {
        self.period + 1
    }

    fn name(&self) -> &str {
        "ATR"
    }
}

/// Donchian channel midpoint: (highest high + lowest low) / 2 over N bars.
///
/// The Ichimoku conversion line, base line and leading span B are all
/// Donchian midpoints of different lengths.
#[derive(Debug, Clone)]
pub struct DonchianMidpoint {
    period: usize,
}

impl DonchianMidpoint {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "Period must be greater than 0");
        Self { period }
    }
}

impl BarIndicator for DonchianMidpoint {
    type Output = f64;

    fn calculate_bars(&self, bars: &[Bar]) -> Vec<Option<f64>> {
        let mut result = vec![None; bars.len()];
        if bars.len() < self.period {
            return result;
        }
        for (i, window) in bars.windows(self.period).enumerate() {
            let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
            let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
            result[i + self.period - 1] = Some((high + low) / 2.0);
        }
        result
    }

    fn period(&self) -> usize {
        self.period
    }

    fn name(&self) -> &str {
        "DonchianMid"
    }
}

/// Rolling mean of a series, used for volume confirmation.
pub fn rolling_mean(data: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 {
        return vec![None; data.len()];
    }
    crate::pad_front(crate::Sma::new(period).calculate(data), data.len())
}

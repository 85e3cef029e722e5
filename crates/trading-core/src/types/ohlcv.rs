//! OHLCV candle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::Timeframe;

/// A single OHLCV candle.
/// Prices are f64 for fast indicator calculations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Candle open time, Unix milliseconds
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Create a new bar.
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Median price, (high + low) / 2. Feeds the Alligator lines and oscillators.
    #[inline]
    pub fn median_price(&self) -> f64 {
        (self.high + self.low) / 2.0
    }

    #[inline]
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    #[inline]
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// A bar is well-formed when every field is finite, volume is
    /// non-negative and high/low bracket open and close.
    pub fn is_well_formed(&self) -> bool {
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        fields.iter().all(|v| v.is_finite())
            && self.volume >= 0.0
            && self.low > 0.0
            && self.high >= self.low
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
    }

    /// Get the timestamp as a DateTime, if representable.
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// True range against the previous close (used for ATR).
    pub fn true_range(&self, prev_close: Option<f64>) -> f64 {
        match prev_close {
            Some(pc) => {
                let hc = (self.high - pc).abs();
                let lc = (self.low - pc).abs();
                self.range().max(hc).max(lc)
            }
            None => self.range(),
        }
    }
}

/// Append-only candle history for one (symbol, timeframe) pair.
///
/// Timestamps are strictly increasing. A bar carrying the same timestamp as
/// the newest stored bar replaces it (the exchange re-sent a still-forming
/// candle); older bars are ignored.
#[derive(Debug, Clone)]
pub struct BarSeries {
    pub symbol: String,
    pub timeframe: Timeframe,
    bars: VecDeque<Bar>,
    /// Maximum retained bars (0 = unlimited)
    capacity: usize,
}

impl BarSeries {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self::with_capacity(symbol, timeframe, 0)
    }

    /// Create a series that drops its oldest bar once `capacity` is reached.
    pub fn with_capacity(symbol: impl Into<String>, timeframe: Timeframe, capacity: usize) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            bars: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Merge one bar into the series. Returns `true` if the series changed.
    pub fn push(&mut self, bar: Bar) -> bool {
        match self.bars.back_mut() {
            Some(last) if bar.timestamp < last.timestamp => return false,
            Some(last) if bar.timestamp == last.timestamp => {
                *last = bar;
                return true;
            }
            _ => {}
        }
        if self.capacity > 0 && self.bars.len() >= self.capacity {
            self.bars.pop_front();
        }
        self.bars.push_back(bar);
        true
    }

    /// Merge a batch of bars. Returns how many bars were appended or replaced.
    pub fn extend(&mut self, bars: impl IntoIterator<Item = Bar>) -> usize {
        bars.into_iter().filter(|bar| self.push(*bar)).count()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }

    /// Get a bar by index (0 = oldest).
    pub fn get(&self, index: usize) -> Option<&Bar> {
        self.bars.get(index)
    }

    /// Contiguous copy of the stored bars, oldest first.
    pub fn to_vec(&self) -> Vec<Bar> {
        self.bars.iter().copied().collect()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.low).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.volume).collect()
    }

    pub fn median_prices(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.median_price()).collect()
    }

    pub fn clear(&mut self) {
        self.bars.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bar> {
        self.bars.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, close: f64) -> Bar {
        Bar::new(ts, close, close + 1.0, close - 1.0, close, 1000.0)
    }

    #[test]
    fn test_bar_calculations() {
        let bar = Bar::new(1000, 100.0, 110.0, 95.0, 105.0, 1000000.0);

        assert!((bar.median_price() - 102.5).abs() < 1e-9);
        assert!((bar.range() - 15.0).abs() < 1e-9);
        assert!(bar.is_bullish());
        assert!(bar.is_well_formed());
    }

    #[test]
    fn test_bar_true_range() {
        let bar = Bar::new(1000, 100.0, 110.0, 95.0, 105.0, 1000000.0);

        assert!((bar.true_range(None) - 15.0).abs() < 1e-9);
        // Gap from a lower previous close widens the range
        assert!((bar.true_range(Some(90.0)) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_bars() {
        assert!(!Bar::new(1, 100.0, 99.0, 101.0, 100.0, 1.0).is_well_formed());
        assert!(!Bar::new(1, 100.0, 101.0, 99.0, f64::NAN, 1.0).is_well_formed());
        assert!(!Bar::new(1, 100.0, 101.0, 99.0, 100.0, -1.0).is_well_formed());
        assert!(!Bar::new(1, 0.0, 0.0, 0.0, 0.0, 1.0).is_well_formed());
    }

    #[test]
    fn test_series_is_monotonic() {
        let mut series = BarSeries::new("BTCUSDT", Timeframe::Hour1);
        assert!(series.push(bar(1, 100.0)));
        assert!(series.push(bar(2, 101.0)));

        // Older candle is ignored
        assert!(!series.push(bar(1, 50.0)));
        assert_eq!(series.len(), 2);

        // Same timestamp replaces the forming candle
        assert!(series.push(bar(2, 105.0)));
        assert_eq!(series.len(), 2);
        assert_eq!(series.last().unwrap().close, 105.0);
    }

    #[test]
    fn test_series_capacity() {
        let mut series = BarSeries::with_capacity("BTCUSDT", Timeframe::Daily, 3);
        let appended = series.extend((1..=4).map(|ts| bar(ts, 100.0 + ts as f64)));

        assert_eq!(appended, 4);
        assert_eq!(series.len(), 3);
        assert_eq!(series.get(0).unwrap().timestamp, 2);
        assert_eq!(series.closes(), vec![102.0, 103.0, 104.0]);
    }
}

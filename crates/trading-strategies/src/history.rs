//! Per-(symbol, timeframe) candle histories shared by the generators.

use std::collections::HashMap;
use tracing::{debug, warn};
use trading_core::types::{Bar, BarSeries, Signal, Timeframe};

/// Candle histories keyed by (symbol, timeframe).
#[derive(Debug, Clone, Default)]
pub struct CandleStore {
    series: HashMap<(String, Timeframe), BarSeries>,
    /// Retained bars per history (0 = unlimited)
    capacity: usize,
}

impl CandleStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            series: HashMap::new(),
            capacity,
        }
    }

    /// Merge bars into a history. Malformed bars are dropped with a warning;
    /// stale bars are ignored by the series itself.
    pub fn update(&mut self, symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> usize {
        let capacity = self.capacity;
        let series = self
            .series
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| BarSeries::with_capacity(symbol, timeframe, capacity));

        let mut taken = 0;
        for bar in bars {
            if !bar.is_well_formed() {
                warn!(symbol, %timeframe, timestamp = bar.timestamp, "Dropping malformed candle");
                continue;
            }
            if series.push(*bar) {
                taken += 1;
            }
        }
        debug!(symbol, %timeframe, taken, total = series.len(), "Candle history updated");
        taken
    }

    pub fn bars(&self, symbol: &str, timeframe: Timeframe) -> Option<Vec<Bar>> {
        self.series
            .get(&(symbol.to_string(), timeframe))
            .map(BarSeries::to_vec)
    }

    pub fn len(&self, symbol: &str, timeframe: Timeframe) -> usize {
        self.series
            .get(&(symbol.to_string(), timeframe))
            .map_or(0, BarSeries::len)
    }

    pub fn total_bars(&self) -> usize {
        self.series.values().map(BarSeries::len).sum()
    }

    pub fn longest(&self) -> usize {
        self.series.values().map(BarSeries::len).max().unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.series.clear();
    }
}

/// Keep only signals raised on the last `window` bars (0 keeps everything).
pub(crate) fn recent_signals(signals: Vec<Signal>, bars: &[Bar], window: usize) -> Vec<Signal> {
    if window == 0 || bars.len() <= window {
        return signals;
    }
    let cutoff = bars[bars.len() - window].timestamp;
    signals.into_iter().filter(|s| s.timestamp >= cutoff).collect()
}

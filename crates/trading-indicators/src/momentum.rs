//! Bill Williams momentum oscillators.

use trading_core::traits::{BarIndicator, Indicator};
use trading_core::types::Bar;

use crate::{pad_front, Sma};

/// Awesome Oscillator: SMA(fast) - SMA(slow) of the median price.
#[derive(Debug, Clone)]
pub struct AwesomeOscillator {
    fast: usize,
    slow: usize,
}

impl AwesomeOscillator {
    /// Standard 5/34 oscillator.
    pub fn new() -> Self {
        Self::with_periods(5, 34)
    }

    pub fn with_periods(fast: usize, slow: usize) -> Self {
        assert!(fast > 0 && fast < slow, "Fast period must be in (0, slow)");
        Self { fast, slow }
    }

    /// Oscillator over a median-price series, aligned to the input.
    pub fn calculate_series(&self, median: &[f64]) -> Vec<Option<f64>> {
        let fast = pad_front(Sma::new(self.fast).calculate(median), median.len());
        let slow = pad_front(Sma::new(self.slow).calculate(median), median.len());
        fast.iter()
            .zip(slow.iter())
            .map(|(f, s)| Some((*f)? - (*s)?))
            .collect()
    }
}

impl Default for AwesomeOscillator {
    fn default() -> Self {
        Self::new()
    }
}

impl BarIndicator for AwesomeOscillator {
    type Output = f64;

    fn calculate_bars(&self, bars: &[Bar]) -> Vec<Option<f64>> {
        let median: Vec<f64> = bars.iter().map(|b| b.median_price()).collect();
        self.calculate_series(&median)
    }

    fn period(&self) -> usize {
        self.slow
    }

    fn name(&self) -> &str {
        "AO"
    }
}

/// Accelerator Oscillator: AO - SMA(signal) of AO.
#[derive(Debug, Clone)]
pub struct AcceleratorOscillator {
    ao: AwesomeOscillator,
    signal: usize,
}

impl AcceleratorOscillator {
    pub fn new() -> Self {
        Self {
            ao: AwesomeOscillator::new(),
            signal: 5,
        }
    }
}

impl Default for AcceleratorOscillator {
    fn default() -> Self {
        Self::new()
    }
}

impl BarIndicator for AcceleratorOscillator {
    type Output = f64;

    fn calculate_bars(&self, bars: &[Bar]) -> Vec<Option<f64>> {
        let ao = self.ao.calculate_bars(bars);
        let first = match ao.iter().position(Option::is_some) {
            Some(first) => first,
            None => return vec![None; bars.len()],
        };

        let defined: Vec<f64> = ao[first..].iter().map(|v| v.unwrap_or(0.0)).collect();
        let signal = pad_front(Sma::new(self.signal).calculate(&defined), defined.len());

        let mut result = vec![None; first];
        result.extend(
            defined
                .iter()
                .zip(signal.iter())
                .map(|(a, s)| s.map(|s| a - s)),
        );
        result
    }

    fn period(&self) -> usize {
        self.ao.period() + self.signal - 1
    }

    fn name(&self) -> &str {
        "AC"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trending_bars(n: usize, step: f64) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let p = 100.0 + i as f64 * step;
                Bar::new(i as i64, p, p + 1.0, p - 1.0, p, 1000.0)
            })
            .collect()
    }

    #[test]
    fn test_ao_alignment() {
        let bars = trending_bars(40, 1.0);
        let ao = AwesomeOscillator::new().calculate_bars(&bars);
        assert_eq!(ao.len(), 40);
        assert!(ao[32].is_none());
        assert!(ao[33].is_some());
    }

    #[test]
    fn test_ao_positive_in_uptrend() {
        let bars = trending_bars(40, 1.0);
        let ao = AwesomeOscillator::new().calculate_bars(&bars);
        // SMA5 - SMA34 of a linear series is (34 - 5) / 2 steps
        assert!((ao[39].unwrap() - 14.5).abs() < 1e-9);
    }

    #[test]
    fn test_ao_negative_in_downtrend() {
        let bars = trending_bars(40, -1.0);
        let ao = AwesomeOscillator::new().calculate_bars(&bars);
        assert!(ao[39].unwrap() < 0.0);
    }

    #[test]
    fn test_ac_alignment_and_flat_value() {
        let bars = trending_bars(45, 1.0);
        let ac = AcceleratorOscillator::new().calculate_bars(&bars);
        assert_eq!(ac.len(), 45);
        assert!(ac[36].is_none());
        // Constant AO means zero acceleration
        assert!(ac[37].unwrap().abs() < 1e-9);
        assert!(ac[44].unwrap().abs() < 1e-9);
    }
}

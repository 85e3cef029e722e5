//! Moving average indicators.

use trading_core::traits::Indicator;

/// Simple Moving Average (SMA).
///
/// Calculates the arithmetic mean of the last N values.
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
}

impl Sma {
    /// Create a new SMA with the specified period.
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "Period must be greater than 0");
        Self { period }
    }
}

impl Indicator for Sma {
    type Output = f64;

    fn calculate(&self, data: &[f64]) -> Vec<f64> {
        if data.len() < self.period {
            return vec![];
        }

        let mut result = Vec::with_capacity(data.len() - self.period + 1);
        let period_f64 = self.period as f64;

        let mut sum: f64 = data[..self.period].iter().sum();
        result.push(sum / period_f64);

        for i in self.period..data.len() {
            sum = sum - data[i - self.period] + data[i];
            result.push(sum / period_f64);
        }

        result
    }

    fn period(&self) -> usize {
        self.period
    }

    fn name(&self) -> &str {
        "SMA"
    }
}

/// Exponential Moving Average (EMA), seeded with the SMA of the first window.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    multiplier: f64,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "Period must be greater than 0");
        let multiplier = 2.0 / (period as f64 + 1.0);
        Self { period, multiplier }
    }
}

impl Indicator for Ema {
    type Output = f64;

    fn calculate(&self, data: &[f64]) -> Vec<f64> {
        smoothed(data, self.period, self.multiplier)
    }

    fn period(&self) -> usize {
        self.period
    }

    fn name(&self) -> &str {
        "EMA"
    }
}

/// Smoothed Moving Average (SMMA, Wilder's moving average).
///
/// `smma[i] = (smma[i-1] * (n - 1) + x[i]) / n`, seeded with the SMA of the
/// first window. Used for the Alligator jaw, teeth and lips.
#[derive(Debug, Clone)]
pub struct Smma {
    period: usize,
}

impl Smma {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "Period must be greater than 0");
        Self { period }
    }
}

impl Indicator for Smma {
    type Output = f64;

    fn calculate(&self, data: &[f64]) -> Vec<f64> {
        smoothed(data, self.period, 1.0 / self.period as f64)
    }

    fn period(&self) -> usize {
        self.period
    }

    fn name(&self) -> &str {
        "SMMA"
    }
}

fn smoothed(data: &[f64], period: usize, alpha: f64) -> Vec<f64> {
    if data.len() < period {
        return vec![];
    }

    let mut result = Vec::with_capacity(data.len() - period + 1);
    let mut value = data[..period].iter().sum::<f64>() / period as f64;
    result.push(value);

    for &x in &data[period..] {
        value = x * alpha + value * (1.0 - alpha);
        result.push(value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let result = Sma::new(3).calculate(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        assert_eq!(result.len(), 3);
        assert!((result[0] - 2.0).abs() < 1e-10);
        assert!((result[2] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn test_sma_insufficient_data() {
        assert!(Sma::new(5).calculate(&[1.0, 2.0, 3.0]).is_empty());
    }

    #[test]
    fn test_ema() {
        let result = Ema::new(3).calculate(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        assert_eq!(result.len(), 3);
        assert!((result[0] - 2.0).abs() < 1e-10);
        // mult = 0.5: 4 * 0.5 + 2 * 0.5
        assert!((result[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn test_smma() {
        let result = Smma::new(3).calculate(&[3.0, 3.0, 3.0, 6.0, 6.0]);

        assert_eq!(result.len(), 3);
        assert!((result[0] - 3.0).abs() < 1e-10);
        // (3 * 2 + 6) / 3
        assert!((result[1] - 4.0).abs() < 1e-10);
        // (4 * 2 + 6) / 3
        assert!((result[2] - 14.0 / 3.0).abs() < 1e-10);
    }

    #[test]
    fn test_smma_lags_ema() {
        let data: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let smma = Smma::new(5).calculate(&data);
        let ema = Ema::new(5).calculate(&data);
        assert!(smma.last().unwrap() < ema.last().unwrap());
    }
}

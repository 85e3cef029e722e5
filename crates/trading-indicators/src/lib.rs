//! Technical indicators used by the signal generators.
//!
//! - Moving averages (SMA, EMA, SMMA)
//! - Bill Williams oscillators (Awesome, Accelerator) and fractals
//! - Volatility and channel indicators (ATR, Donchian midpoint)
//!
//! Window indicators return one value per complete window; [`pad_front`]
//! aligns such output with the input series.

pub mod fractals;
pub mod momentum;
pub mod moving_average;
pub mod volatility;

pub use fractals::{Fractal, Fractals};
pub use momentum::{AcceleratorOscillator, AwesomeOscillator};
pub use moving_average::{Ema, Sma, Smma};
pub use volatility::{rolling_mean, Atr, DonchianMidpoint};

/// Left-pad window output with `None` so index `i` lines up with input `i`.
pub fn pad_front(values: Vec<f64>, len: usize) -> Vec<Option<f64>> {
    let missing = len.saturating_sub(values.len());
    let mut result = vec![None; missing];
    result.extend(values.into_iter().take(len).map(Some));
    result
}

/// Shift a series `shift` bars forward in time, as drawn on a chart.
///
/// The value at output index `i` is the input value at `i - shift`.
pub fn shift_forward(values: &[Option<f64>], shift: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| i.checked_sub(shift).and_then(|j| values[j]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_front() {
        assert_eq!(pad_front(vec![1.0, 2.0], 4), vec![None, None, Some(1.0), Some(2.0)]);
        assert_eq!(pad_front(vec![], 2), vec![None, None]);
    }

    #[test]
    fn test_shift_forward() {
        let values = vec![Some(1.0), Some(2.0), Some(3.0)];
        assert_eq!(shift_forward(&values, 1), vec![None, Some(1.0), Some(2.0)]);
        assert_eq!(shift_forward(&values, 5), vec![None, None, None]);
    }
}

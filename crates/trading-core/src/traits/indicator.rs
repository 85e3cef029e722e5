//! Indicator trait definitions.

use crate::error::IndicatorError;
use crate::types::Bar;

/// Indicator over a single price series.
///
/// `calculate` returns one value per complete window, so the first output
/// lines up with input index `period() - 1`.
pub trait Indicator: Send + Sync {
    type Output;

    fn calculate(&self, data: &[f64]) -> Vec<Self::Output>;

    /// Minimum data points required.
    fn period(&self) -> usize;

    fn name(&self) -> &str;

    /// Validate that there's enough data.
    fn validate_data(&self, data: &[f64]) -> Result<(), IndicatorError> {
        if data.len() < self.period() {
            return Err(IndicatorError::InsufficientData {
                required: self.period(),
                available: data.len(),
            });
        }
        Ok(())
    }
}

/// Indicator that needs whole candles (high/low/close/volume), not one series.
pub trait BarIndicator: Send + Sync {
    type Output;

    /// One output per input bar; `None` until the indicator is defined.
    fn calculate_bars(&self, bars: &[Bar]) -> Vec<Option<Self::Output>>;

    fn period(&self) -> usize;

    fn name(&self) -> &str;
}

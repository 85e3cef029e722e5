//! Williams fractals.

use serde::{Deserialize, Serialize};
use trading_core::traits::BarIndicator;
use trading_core::types::Bar;

/// Fractal marks on a single bar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fractal {
    /// High strictly above the `span` highs on each side
    pub up: bool,
    /// Low strictly below the `span` lows on each side
    pub down: bool,
}

/// Williams fractal detector.
///
/// A bar can only be confirmed once `span` later bars exist, so the last
/// `span` outputs are always `None`.
#[derive(Debug, Clone)]
pub struct Fractals {
    span: usize,
}

impl Fractals {
    /// Classic five-bar fractal (two bars each side).
    pub fn new() -> Self {
        Self::with_span(2)
    }

    pub fn with_span(span: usize) -> Self {
        assert!(span > 0, "Span must be greater than 0");
        Self { span }
    }
}

impl Default for Fractals {
    fn default() -> Self {
        Self::new()
    }
}

impl BarIndicator for Fractals {
    type Output = Fractal;

    fn calculate_bars(&self, bars: &[Bar]) -> Vec<Option<Fractal>> {
        let n = bars.len();
        let mut result = vec![None; n];
        if n < 2 * self.span + 1 {
            return result;
        }

        for i in self.span..n - self.span {
            let neighbours = bars[i - self.span..i]
                .iter()
                .chain(bars[i + 1..=i + self.span].iter());
            let (mut up, mut down) = (true, true);
            for other in neighbours {
                up &= bars[i].high > other.high;
                down &= bars[i].low < other.low;
            }
            result[i] = Some(Fractal { up, down });
        }
        result
    }

    fn period(&self) -> usize {
        2 * self.span + 1
    }

    fn name(&self) -> &str {
        "Fractals"
    }
}

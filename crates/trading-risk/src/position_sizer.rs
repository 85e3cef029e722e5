//! Position sizing: turns a consensus signal into an order quantity.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Position sizing method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PositionSizingMethod {
    /// Fixed base-asset quantity
    Fixed { quantity: Decimal },
    /// Fixed quote notional
    FixedNotional { amount: Decimal },
    /// Percentage of account value
    PercentEquity { percent: Decimal },
    /// Percentage of account value at risk between entry and stop
    RiskBased { risk_percent: Decimal },
}

impl Default for PositionSizingMethod {
    fn default() -> Self {
        PositionSizingMethod::PercentEquity { percent: dec!(2) }
    }
}

/// Position sizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionSizer {
    pub method: PositionSizingMethod,
    pub max_quantity: Option<Decimal>,
    pub max_notional: Option<Decimal>,
    /// Scale the size by signal confidence
    pub scale_by_confidence: bool,
    /// Decimal places of the exchange lot size
    pub quantity_precision: u32,
}

impl Default for PositionSizer {
    fn default() -> Self {
        Self::new(PositionSizingMethod::default())
    }
}

impl PositionSizer {
    pub fn new(method: PositionSizingMethod) -> Self {
        Self {
            method,
            max_quantity: None,
            max_notional: None,
            scale_by_confidence: true,
            quantity_precision: 6,
        }
    }

    pub fn with_max_quantity(mut self, max: Decimal) -> Self {
        self.max_quantity = Some(max);
        self
    }

    pub fn with_max_notional(mut self, max: Decimal) -> Self {
        self.max_notional = Some(max);
        self
    }

    pub fn without_confidence_scaling(mut self) -> Self {
        self.scale_by_confidence = false;
        self
    }

    pub fn with_precision(mut self, dp: u32) -> Self {
        self.quantity_precision = dp;
        self
    }

    /// Quantity to trade at `price` for an account worth `account_value`.
    ///
    /// Returns zero when no sensible size exists (non-positive price, stop
    /// at the entry, or a size that rounds away).
    pub fn calculate(
        &self,
        account_value: Decimal,
        price: Decimal,
        confidence: f64,
        stop_loss: Option<Decimal>,
    ) -> Decimal {
        if price <= Decimal::ZERO || account_value < Decimal::ZERO {
            return Decimal::ZERO;
        }

        let base = match &self.method {
            PositionSizingMethod::Fixed { quantity } => *quantity,
            PositionSizingMethod::FixedNotional { amount } => *amount / price,
            PositionSizingMethod::PercentEquity { percent } => {
                account_value * (*percent / dec!(100)) / price
            }
            PositionSizingMethod::RiskBased { risk_percent } => {
                let at_risk = account_value * (*risk_percent / dec!(100));
                match stop_loss {
                    Some(stop) => {
                        let per_unit = (price - stop).abs();
                        if per_unit.is_zero() {
                            return Decimal::ZERO;
                        }
                        at_risk / per_unit
                    }
                    // No stop: risk the whole notional
                    None => at_risk / price,
                }
            }
        };

        let mut size = if self.scale_by_confidence {
            let confidence = Decimal::try_from(confidence.clamp(0.0, 1.0)).unwrap_or(Decimal::ONE);
            base * confidence
        } else {
            base
        };

        if let Some(max) = self.max_quantity {
            size = size.min(max);
        }
        if let Some(max_notional) = self.max_notional {
            size = size.min(max_notional / price);
        }

        size.max(Decimal::ZERO)
            .round_dp_with_strategy(self.quantity_precision, rust_decimal::RoundingStrategy::ToZero)
    }
}

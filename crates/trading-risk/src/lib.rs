//! Pre-trade risk management.
//!
//! Provides the [`RiskManager`] gate (position limits and a daily-loss
//! circuit breaker) and the [`PositionSizer`] used to size new orders.

mod position_sizer;
mod risk_manager;

pub use position_sizer::{PositionSizer, PositionSizingMethod};
pub use risk_manager::{RiskConfig, RiskDecision, RiskLimits, RiskManager, RiskProfile};

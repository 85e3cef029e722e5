//! Signal generators and signal aggregation.
//!
//! Strategies replay their per-(symbol, timeframe) candle history and emit
//! [`Signal`](trading_core::types::Signal)s:
//! - Alligator (trend channel with AO/AC/fractal/volume confirmation)
//! - Darvas Box (consolidation breakout)
//! - Renko (brick reversals, continuations and pullbacks)
//! - Ichimoku (cloud-filtered Tenkan/Kijun crosses)
//!
//! The [`SignalAggregator`] turns the raw signals of many generators into
//! per-symbol consensus signals.

mod aggregator;
mod alligator;
mod darvas;
mod history;
mod ichimoku;
mod registry;
mod renko;

pub use aggregator::{
    aggregate_signals, exit_signals, filter_signals, AggregationResult, AggregatorConfig,
    SignalAggregator,
};
pub use alligator::{AlligatorConfig, AlligatorState, AlligatorStrategy};
pub use darvas::{DarvasBox, DarvasBoxStrategy, DarvasConfig};
pub use history::CandleStore;
pub use ichimoku::{IchimokuConfig, IchimokuLines, IchimokuStrategy};
pub use registry::{StrategyInfo, StrategyKind, StrategyRegistry};
pub use renko::{build_bricks, Brick, RenkoConfig, RenkoStrategy};

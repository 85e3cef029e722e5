//! Core data types for the trading system.

mod alert;
mod market;
mod ohlcv;
mod order;
mod position;
mod signal;
mod timeframe;

pub use alert::{Alert, AlertSeverity};
pub use market::{
    Balance, MarketChannel, MarketEvent, OrderEvent, PositionEvent, StreamStatus,
    StreamStatusEvent,
};
pub use ohlcv::{Bar, BarSeries};
pub use order::{ExecutionReport, Fill, Order, OrderSpec, OrderStatus, OrderType, Side};
pub use position::{Position, PositionBook, PositionChange};
pub use signal::{ConsensusSignal, Signal, SignalMetadata, SignalType};
pub use timeframe::Timeframe;

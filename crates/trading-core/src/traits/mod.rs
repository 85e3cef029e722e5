//! Core traits for the trading system.

mod alert;
mod data_service;
mod exchange;
mod indicator;
mod signal_generator;

pub use alert::AlertSink;
pub use data_service::{MarketDataSource, TradingDataService};
pub use exchange::{ExchangeConnector, OrderAck, OrderRef, SubscriptionHandle};
pub use indicator::{BarIndicator, Indicator};
pub use signal_generator::{SignalGenerator, StrategyConfig, StrategyState};

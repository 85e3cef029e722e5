//! Market and account data for the pipeline.
//!
//! - [`CsvDataSource`]: candles from CSV files for offline runs
//! - [`ConnectorDataSource`]: candles from an exchange connector
//! - [`PriceCache`]: latest prices fed by market-data streams
//! - [`InMemoryTradingData`] / [`ConnectorTradingData`]: the account and
//!   price service consumed by the risk gate

mod cache;
mod csv_source;
mod service;

pub use cache::{CachedPrice, PriceCache};
pub use csv_source::CsvDataSource;
pub use service::{ConnectorDataSource, ConnectorTradingData, InMemoryTradingData};

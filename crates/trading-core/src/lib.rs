//! Core types and traits for the trading pipeline.
//!
//! This crate provides the foundational building blocks including:
//! - Market data types (Bar, BarSeries, Timeframe, market/user stream events)
//! - Signals and consensus signals
//! - Order, position and position-book types
//! - Core traits for signal generators, indicators, exchange connectors,
//!   trading-data services and alert sinks

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;

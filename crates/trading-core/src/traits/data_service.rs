//! Account and market data collaborators.

use crate::error::DataError;
use crate::types::{Balance, Bar, Timeframe};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;

/// Account and price data consumed by risk checks.
#[async_trait]
pub trait TradingDataService: Send + Sync {
    async fn get_balances(&self, account: &str) -> Result<Vec<Balance>, DataError>;

    /// Mark price of a trading pair, e.g. "BTCUSDT".
    async fn get_price(&self, symbol: &str) -> Result<Decimal, DataError>;

    /// Realized P&L booked for `account` on the UTC `day`.
    async fn get_realized_pnl(&self, account: &str, day: NaiveDate) -> Result<Decimal, DataError>;
}

/// Source of historical candles for signal generation.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// The most recent `limit` candles, oldest first.
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, DataError>;

    fn name(&self) -> &str;
}

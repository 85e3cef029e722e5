//! Account/price data services used by the risk gate, and a candle source
//! backed by an exchange connector.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;
use trading_core::error::{DataError, ExchangeError};
use trading_core::traits::{ExchangeConnector, MarketDataSource, TradingDataService};
use trading_core::types::{Balance, Bar, PositionBook, Timeframe};

use crate::PriceCache;

fn data_error(error: ExchangeError) -> DataError {
    match error {
        ExchangeError::Network(msg) | ExchangeError::WebSocket(msg) => DataError::ConnectionError(msg),
        ExchangeError::Timeout(ms) => DataError::ConnectionError(format!("timed out after {}ms", ms)),
        ExchangeError::Decode(msg) => DataError::ParseError(msg),
        other => DataError::Internal(other.to_string()),
    }
}

/// In-memory account data: configured balances, cached prices and realized
/// PnL from the shared position book. Backs paper trading and tests.
pub struct InMemoryTradingData {
    balances: RwLock<HashMap<String, Vec<Balance>>>,
    prices: Arc<PriceCache>,
    positions: Arc<PositionBook>,
}

impl InMemoryTradingData {
    pub fn new(prices: Arc<PriceCache>, positions: Arc<PositionBook>) -> Self {
        Self {
            balances: RwLock::new(HashMap::new()),
            prices,
            positions,
        }
    }

    pub fn set_balances(&self, account: &str, balances: Vec<Balance>) {
        self.balances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account.to_string(), balances);
    }

    pub fn prices(&self) -> &Arc<PriceCache> {
        &self.prices
    }
}

#[async_trait]
impl TradingDataService for InMemoryTradingData {
    async fn get_balances(&self, account: &str) -> Result<Vec<Balance>, DataError> {
        self.balances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(account)
            .cloned()
            .ok_or_else(|| DataError::Internal(format!("No balances for account {}", account)))
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal, DataError> {
        self.prices
            .get(symbol)
            .ok_or_else(|| DataError::PriceUnavailable(symbol.to_string()))
    }

    async fn get_realized_pnl(&self, account: &str, day: NaiveDate) -> Result<Decimal, DataError> {
        Ok(self.positions.realized_pnl(account, day))
    }
}

/// Live account data: balances from an exchange connector, prices from the
/// stream-fed cache with a candle fallback, realized PnL from the position
/// book.
pub struct ConnectorTradingData {
    connector: Arc<dyn ExchangeConnector>,
    prices: Arc<PriceCache>,
    positions: Arc<PositionBook>,
    max_price_age: Duration,
}

impl ConnectorTradingData {
    pub fn new(connector: Arc<dyn ExchangeConnector>, prices: Arc<PriceCache>, positions: Arc<PositionBook>) -> Self {
        Self {
            connector,
            prices,
            positions,
            max_price_age: Duration::seconds(60),
        }
    }

    pub fn with_max_price_age(mut self, age: Duration) -> Self {
        self.max_price_age = age;
        self
    }
}

#[async_trait]
impl TradingDataService for ConnectorTradingData {
    async fn get_balances(&self, _account: &str) -> Result<Vec<Balance>, DataError> {
        self.connector.get_balances().await.map_err(data_error)
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal, DataError> {
        if let Some(price) = self.prices.get_fresh(symbol, self.max_price_age) {
            return Ok(price);
        }

        let candles = self
            .connector
            .get_candles(symbol, Timeframe::Minute1, 1)
            .await
            .map_err(data_error)?;
        let close = candles
            .last()
            .and_then(|bar| Decimal::try_from(bar.close).ok())
            .ok_or_else(|| DataError::PriceUnavailable(symbol.to_string()))?;
        debug!(symbol, %close, "Price refreshed from candles");
        self.prices.set(symbol, close);
        Ok(close)
    }

    async fn get_realized_pnl(&self, account: &str, day: NaiveDate) -> Result<Decimal, DataError> {
        Ok(self.positions.realized_pnl(account, day))
    }
}

/// Candle source reading from an exchange connector.
pub struct ConnectorDataSource {
    connector: Arc<dyn ExchangeConnector>,
}

impl ConnectorDataSource {
    pub fn new(connector: Arc<dyn ExchangeConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl MarketDataSource for ConnectorDataSource {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, DataError> {
        self.connector
            .get_candles(symbol, timeframe, limit)
            .await
            .map_err(data_error)
    }

    fn name(&self) -> &str {
        self.connector.id()
    }
}

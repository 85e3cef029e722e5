//! Events delivered by exchange streams, and account balances.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Bar, ExecutionReport, Timeframe};

/// Market-data stream kinds a connector can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketChannel {
    Trades,
    Ticker,
    Klines(Timeframe),
}

impl std::fmt::Display for MarketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketChannel::Trades => f.write_str("trade"),
            MarketChannel::Ticker => f.write_str("ticker"),
            MarketChannel::Klines(tf) => write!(f, "kline_{}", tf),
        }
    }
}

/// Public market-data event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    Trade {
        exchange: String,
        symbol: String,
        price: Decimal,
        quantity: Decimal,
        timestamp: i64,
    },
    Ticker {
        exchange: String,
        symbol: String,
        bid: Decimal,
        ask: Decimal,
        last: Decimal,
        timestamp: i64,
    },
    Kline {
        exchange: String,
        symbol: String,
        timeframe: Timeframe,
        bar: Bar,
        /// Whether the candle is closed
        closed: bool,
    },
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Trade { symbol, .. }
            | MarketEvent::Ticker { symbol, .. }
            | MarketEvent::Kline { symbol, .. } => symbol,
        }
    }

    /// Best current price carried by the event.
    pub fn last_price(&self) -> Option<Decimal> {
        match self {
            MarketEvent::Trade { price, .. } => Some(*price),
            MarketEvent::Ticker { last, .. } => Some(*last),
            MarketEvent::Kline { bar, .. } => Decimal::try_from(bar.close).ok(),
        }
    }
}

/// Execution update for one order, from the user-data stream or a poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub exchange: String,
    pub symbol: String,
    pub exchange_order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub report: ExecutionReport,
    pub timestamp: DateTime<Utc>,
}

/// Account balance change from the user-data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub exchange: String,
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Holding of one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn new(asset: impl Into<String>, free: Decimal, locked: Decimal) -> Self {
        Self {
            asset: asset.into(),
            free,
            locked,
        }
    }

    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Lifecycle of a supervised stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamStatus {
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted; the caller should fall back to polling
    StreamFailed { reason: String },
    Closed,
}

/// Status change of the stream named `stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatusEvent {
    pub exchange: String,
    /// e.g. "btcusdt@kline_1h" or "user_data"
    pub stream: String,
    pub status: StreamStatus,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_channel_names() {
        assert_eq!(MarketChannel::Trades.to_string(), "trade");
        assert_eq!(MarketChannel::Klines(Timeframe::Hour1).to_string(), "kline_1h");
    }

    #[test]
    fn test_event_price() {
        let event = MarketEvent::Trade {
            exchange: "sim".into(),
            symbol: "BTCUSDT".into(),
            price: dec!(50000),
            quantity: dec!(0.1),
            timestamp: 0,
        };
        assert_eq!(event.symbol(), "BTCUSDT");
        assert_eq!(event.last_price(), Some(dec!(50000)));
    }

    #[test]
    fn test_balance_total() {
        assert_eq!(Balance::new("BTC", dec!(1.5), dec!(0.5)).total(), dec!(2.0));
    }
}

//! Latest-price cache fed by market-data events.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use trading_core::types::MarketEvent;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedPrice {
    pub price: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Concurrent symbol -> last price map.
#[derive(Debug, Default)]
pub struct PriceCache {
    prices: DashMap<String, CachedPrice>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, symbol: &str, price: Decimal) {
        self.set_at(symbol, price, Utc::now());
    }

    pub fn set_at(&self, symbol: &str, price: Decimal, at: DateTime<Utc>) {
        self.prices.insert(
            symbol.to_string(),
            CachedPrice {
                price,
                updated_at: at,
            },
        );
    }

    /// Record the price carried by a market event, if any.
    pub fn apply(&self, event: &MarketEvent) {
        if let Some(price) = event.last_price() {
            self.set(event.symbol(), price);
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).map(|entry| entry.price)
    }

    /// Price no older than `max_age`.
    pub fn get_fresh(&self, symbol: &str, max_age: Duration) -> Option<Decimal> {
        let cached = *self.prices.get(symbol)?;
        (Utc::now() - cached.updated_at <= max_age).then_some(cached.price)
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.prices.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_apply_trade_event() {
        let cache = PriceCache::new();
        cache.apply(&MarketEvent::Trade {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            price: dec!(50123.5),
            quantity: dec!(0.01),
            timestamp: 1_700_000_000_000,
        });

        assert_eq!(cache.get("BTCUSDT"), Some(dec!(50123.5)));
        assert_eq!(cache.get("ETHUSDT"), None);
        assert_eq!(cache.symbols(), vec!["BTCUSDT".to_string()]);
    }

    #[test]
    fn test_freshness() {
        let cache = PriceCache::new();
        cache.set_at("ETHUSDT", dec!(3000), Utc::now() - Duration::minutes(10));

        assert_eq!(cache.get_fresh("ETHUSDT", Duration::minutes(15)), Some(dec!(3000)));
        assert_eq!(cache.get_fresh("ETHUSDT", Duration::minutes(5)), None);
    }
}

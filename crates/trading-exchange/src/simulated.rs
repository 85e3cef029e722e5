//! Simulated exchange for paper trading and tests.
//!
//! All exchange state lives in an explicit [`SimulatedExchangeState`] owned
//! by the connector, so independent connectors never share an order book.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use trading_core::error::ExchangeError;
use trading_core::traits::{ExchangeConnector, OrderAck, OrderRef, SubscriptionHandle};
use trading_core::types::{
    Balance, Bar, ExecutionReport, MarketChannel, MarketEvent, OrderEvent, OrderSpec, OrderStatus,
    OrderType, PositionEvent, Side, StreamStatus, StreamStatusEvent, Timeframe,
};
use uuid::Uuid;

/// Simulated exchange settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    pub id: String,
    pub quote_asset: String,
    /// Market order slippage in percent
    pub slippage_pct: Decimal,
    /// Fee in percent of notional, charged in the quote asset
    pub fee_pct: Decimal,
    pub initial_balances: BTreeMap<String, Decimal>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            id: "simulated".to_string(),
            quote_asset: "USDT".to_string(),
            slippage_pct: dec!(0.05),
            fee_pct: Decimal::ZERO,
            initial_balances: BTreeMap::from([("USDT".to_string(), dec!(100000))]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedOrder {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub executed_qty: Decimal,
    pub quote_qty: Decimal,
    pub status: OrderStatus,
}

impl SimulatedOrder {
    fn report(&self) -> ExecutionReport {
        let avg_price = (self.executed_qty > Decimal::ZERO).then(|| self.quote_qty / self.executed_qty);
        ExecutionReport::new(self.status, self.executed_qty, avg_price)
    }

    fn ack(&self) -> OrderAck {
        OrderAck {
            exchange_order_id: self.exchange_order_id.clone(),
            client_order_id: self.client_order_id.clone(),
            report: self.report(),
        }
    }
}

enum Injected {
    /// Fail the next order call without touching the book
    Fail(ExchangeError),
    /// Accept the next order but lose the response
    DropAck(ExchangeError),
}

struct MarketSubscription {
    id: u64,
    symbols: HashSet<String>,
    channels: Vec<MarketChannel>,
    sink: mpsc::Sender<MarketEvent>,
}

struct UserSubscription {
    id: u64,
    orders: mpsc::Sender<OrderEvent>,
    positions: mpsc::Sender<PositionEvent>,
}

/// Balances, prices, candles and the order book of one simulated exchange.
#[derive(Default)]
pub struct SimulatedExchangeState {
    balances: BTreeMap<String, Balance>,
    prices: HashMap<String, Decimal>,
    candles: HashMap<(String, Timeframe), Vec<Bar>>,
    orders: BTreeMap<String, SimulatedOrder>,
    by_client_id: HashMap<String, String>,
    next_order_id: u64,
    injected: VecDeque<Injected>,
    market_subs: Vec<MarketSubscription>,
    user_subs: Vec<UserSubscription>,
    next_sub_id: u64,
}

impl SimulatedExchangeState {
    pub fn balance(&self, asset: &str) -> Decimal {
        self.balances.get(asset).map(|b| b.free).unwrap_or(Decimal::ZERO)
    }

    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).copied()
    }

    pub fn order(&self, exchange_order_id: &str) -> Option<&SimulatedOrder> {
        self.orders.get(exchange_order_id)
    }

    pub fn order_by_client_id(&self, client_order_id: &str) -> Option<&SimulatedOrder> {
        self.by_client_id
            .get(client_order_id)
            .and_then(|id| self.orders.get(id))
    }

    pub fn open_orders(&self) -> Vec<&SimulatedOrder> {
        self.orders.values().filter(|o| o.status.is_active()).collect()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    fn credit(&mut self, asset: &str, amount: Decimal) {
        self.balances
            .entry(asset.to_string())
            .or_insert_with(|| Balance::new(asset, Decimal::ZERO, Decimal::ZERO))
            .free += amount;
    }
}

/// Messages to deliver once the state lock is released.
#[derive(Default)]
struct Outbox {
    market: Vec<(mpsc::Sender<MarketEvent>, MarketEvent)>,
    orders: Vec<(mpsc::Sender<OrderEvent>, OrderEvent)>,
    positions: Vec<(mpsc::Sender<PositionEvent>, PositionEvent)>,
}

impl Outbox {
    async fn deliver(self) {
        for (sink, event) in self.market {
            let _ = sink.send(event).await;
        }
        for (sink, event) in self.orders {
            let _ = sink.send(event).await;
        }
        for (sink, event) in self.positions {
            let _ = sink.send(event).await;
        }
    }
}

/// Exchange connector backed by in-process state.
pub struct SimulatedConnector {
    config: SimulatedConfig,
    state: Arc<Mutex<SimulatedExchangeState>>,
}

impl SimulatedConnector {
    pub fn new(config: SimulatedConfig) -> Self {
        let mut state = SimulatedExchangeState::default();
        for (asset, amount) in &config.initial_balances {
            state.credit(&asset.to_uppercase(), *amount);
        }
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Read access to the exchange state.
    pub fn state(&self) -> MutexGuard<'_, SimulatedExchangeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn deposit(&self, asset: &str, amount: Decimal) {
        self.state().credit(asset, amount);
    }

    /// Candles returned by `get_candles`, oldest first.
    pub fn load_candles(&self, symbol: &str, timeframe: Timeframe, bars: Vec<Bar>) {
        let mut state = self.state();
        if let Some(last) = bars.last() {
            if let Ok(close) = Decimal::try_from(last.close) {
                state.prices.entry(symbol.to_string()).or_insert(close);
            }
        }
        state.candles.insert((symbol.to_string(), timeframe), bars);
    }

    /// Fail the next order placement with `error`.
    pub fn fail_next_order(&self, error: ExchangeError) {
        self.state().injected.push_back(Injected::Fail(error));
    }

    /// Accept the next order but answer with `error`, as if the response
    /// was lost in transit.
    pub fn drop_next_ack(&self, error: ExchangeError) {
        self.state().injected.push_back(Injected::DropAck(error));
    }

    /// Move the market: publishes a trade and fills resting limit orders
    /// the new price crosses.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        let mut outbox = Outbox::default();
        {
            let mut state = self.state();
            state.prices.insert(symbol.to_string(), price);

            let event = MarketEvent::Trade {
                exchange: self.config.id.clone(),
                symbol: symbol.to_string(),
                price,
                quantity: Decimal::ZERO,
                timestamp: Utc::now().timestamp_millis(),
            };
            for sub in &state.market_subs {
                let wants_trades = sub
                    .channels
                    .iter()
                    .any(|c| matches!(c, MarketChannel::Trades | MarketChannel::Ticker));
                if wants_trades && sub.symbols.contains(symbol) {
                    outbox.market.push((sub.sink.clone(), event.clone()));
                }
            }

            let crossing: Vec<(String, Decimal)> = state
                .orders
                .values()
                .filter(|o| o.symbol == symbol && o.status.is_active())
                .filter_map(|o| {
                    let limit = o.price?;
                    let crosses = match o.side {
                        Side::Buy => price <= limit,
                        Side::Sell => price >= limit,
                    };
                    crosses.then(|| (o.exchange_order_id.clone(), o.quantity - o.executed_qty))
                })
                .collect();
            for (order_id, remaining) in crossing {
                let limit = state.orders.get(&order_id).and_then(|o| o.price).unwrap_or(price);
                if let Err(e) = self.execute(&mut state, &order_id, remaining, limit, &mut outbox) {
                    debug!(order_id, "Resting order not filled: {}", e);
                }
            }
        }
        outbox.deliver().await;
    }

    /// Execute `quantity` of a resting order at `price`, e.g. to simulate a
    /// partial fill.
    pub async fn fill_order(
        &self,
        exchange_order_id: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<OrderAck, ExchangeError> {
        let mut outbox = Outbox::default();
        let ack = {
            let mut state = self.state();
            self.execute(&mut state, exchange_order_id, quantity, price, &mut outbox)?
        };
        outbox.deliver().await;
        Ok(ack)
    }

    fn base_asset<'a>(&self, symbol: &'a str) -> Result<&'a str, ExchangeError> {
        symbol
            .strip_suffix(self.config.quote_asset.as_str())
            .filter(|base| !base.is_empty())
            .ok_or_else(|| ExchangeError::Rejected {
                code: Some(-1121),
                reason: format!("Invalid symbol {}", symbol),
            })
    }

    fn fee(&self, notional: Decimal) -> Decimal {
        notional * self.config.fee_pct / dec!(100)
    }

    fn check_funds(
        &self,
        state: &SimulatedExchangeState,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<(), ExchangeError> {
        let base = self.base_asset(symbol)?;
        let (asset, required) = match side {
            Side::Buy => {
                let notional = quantity * price;
                (self.config.quote_asset.as_str(), notional + self.fee(notional))
            }
            Side::Sell => (base, quantity),
        };
        let available = state.balance(asset);
        if available < required {
            return Err(ExchangeError::Rejected {
                code: Some(-2010),
                reason: format!(
                    "Account has insufficient balance: {} {} required, {} available",
                    required, asset, available
                ),
            });
        }
        Ok(())
    }

    /// Apply an execution to the book and balances, queueing stream events.
    fn execute(
        &self,
        state: &mut SimulatedExchangeState,
        exchange_order_id: &str,
        quantity: Decimal,
        price: Decimal,
        outbox: &mut Outbox,
    ) -> Result<OrderAck, ExchangeError> {
        let order = state
            .orders
            .get(exchange_order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(exchange_order_id.to_string()))?;
        if order.status.is_terminal() {
            return Ok(order.ack());
        }
        let quantity = quantity.min(order.quantity - order.executed_qty);
        if quantity <= Decimal::ZERO {
            return Ok(order.ack());
        }
        self.check_funds(state, &order.symbol, order.side, quantity, price)?;

        let base = self.base_asset(&order.symbol)?.to_string();
        let quote = self.config.quote_asset.clone();
        let notional = quantity * price;
        let fee = self.fee(notional);
        match order.side {
            Side::Buy => {
                state.credit(&quote, -(notional + fee));
                state.credit(&base, quantity);
            }
            Side::Sell => {
                state.credit(&base, -quantity);
                state.credit(&quote, notional - fee);
            }
        }

        let updated = {
            let entry = state
                .orders
                .get_mut(exchange_order_id)
                .ok_or_else(|| ExchangeError::OrderNotFound(exchange_order_id.to_string()))?;
            entry.executed_qty += quantity;
            entry.quote_qty += notional;
            entry.status = if entry.executed_qty >= entry.quantity {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            entry.clone()
        };
        debug!(
            exchange = %self.config.id,
            order_id = exchange_order_id,
            %quantity,
            %price,
            status = %updated.status,
            "Simulated execution"
        );

        let now = Utc::now();
        for sub in &state.user_subs {
            outbox.orders.push((
                sub.orders.clone(),
                OrderEvent {
                    exchange: self.config.id.clone(),
                    symbol: updated.symbol.clone(),
                    exchange_order_id: Some(updated.exchange_order_id.clone()),
                    client_order_id: Some(updated.client_order_id.clone()),
                    report: updated.report(),
                    timestamp: now,
                },
            ));
            for asset in [&base, &quote] {
                outbox.positions.push((
                    sub.positions.clone(),
                    PositionEvent {
                        exchange: self.config.id.clone(),
                        asset: asset.clone(),
                        free: state.balance(asset),
                        locked: Decimal::ZERO,
                        timestamp: now,
                    },
                ));
            }
        }
        Ok(updated.ack())
    }

    fn status_channel(&self, stream: &str) -> mpsc::Receiver<StreamStatusEvent> {
        let (tx, rx) = mpsc::channel(4);
        let _ = tx.try_send(StreamStatusEvent {
            exchange: self.config.id.clone(),
            stream: stream.to_string(),
            status: StreamStatus::Connected,
            timestamp: Utc::now(),
        });
        rx
    }

    /// Task that removes subscription `id` once shutdown is signalled.
    fn unsubscribe_on_shutdown(&self, id: u64, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.market_subs.retain(|s| s.id != id);
            state.user_subs.retain(|s| s.id != id);
        })
    }
}

#[async_trait]
impl ExchangeConnector for SimulatedConnector {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        info!(exchange = %self.config.id, "Simulated exchange connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ExchangeError> {
        info!(exchange = %self.config.id, "Simulated exchange disconnected");
        Ok(())
    }

    async fn place_order(&self, spec: &OrderSpec) -> Result<OrderAck, ExchangeError> {
        spec.validate().map_err(ExchangeError::InvalidRequest)?;

        let mut outbox = Outbox::default();
        let result = {
            let mut state = self.state();
            let injected = state.injected.pop_front();
            if let Some(Injected::Fail(error)) = injected {
                return Err(error);
            }

            let client_order_id = spec
                .client_order_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
            if state.by_client_id.contains_key(&client_order_id) {
                return Err(ExchangeError::Rejected {
                    code: Some(-2010),
                    reason: "Duplicate order sent.".into(),
                });
            }
            self.base_asset(&spec.symbol)?;
            let market_price = state.price(&spec.symbol).ok_or_else(|| ExchangeError::Rejected {
                code: None,
                reason: format!("No market price for {}", spec.symbol),
            })?;

            // Market orders fill now with slippage; limit orders fill now
            // only when marketable, at their limit price
            let fill_price = match (spec.order_type, spec.price) {
                (OrderType::Limit, Some(limit)) => match spec.side {
                    Side::Buy if market_price <= limit => Some(limit),
                    Side::Sell if market_price >= limit => Some(limit),
                    _ => None,
                },
                _ => Some(match spec.side {
                    Side::Buy => market_price * (Decimal::ONE + self.config.slippage_pct / dec!(100)),
                    Side::Sell => market_price * (Decimal::ONE - self.config.slippage_pct / dec!(100)),
                }),
            };
            self.check_funds(&state, &spec.symbol, spec.side, spec.quantity, fill_price.or(spec.price).unwrap_or(market_price))?;

            state.next_order_id += 1;
            let exchange_order_id = state.next_order_id.to_string();
            let order = SimulatedOrder {
                exchange_order_id: exchange_order_id.clone(),
                client_order_id: client_order_id.clone(),
                symbol: spec.symbol.clone(),
                side: spec.side,
                order_type: spec.order_type,
                quantity: spec.quantity,
                price: spec.price,
                executed_qty: Decimal::ZERO,
                quote_qty: Decimal::ZERO,
                status: OrderStatus::Open,
            };
            state.orders.insert(exchange_order_id.clone(), order.clone());
            state.by_client_id.insert(client_order_id, exchange_order_id.clone());

            let ack = match fill_price {
                Some(price) => self.execute(&mut state, &exchange_order_id, spec.quantity, price, &mut outbox)?,
                None => order.ack(),
            };
            info!(
                exchange = %self.config.id,
                symbol = %spec.symbol,
                side = %spec.side,
                quantity = %spec.quantity,
                order_id = %ack.exchange_order_id,
                status = %ack.report.status,
                "Simulated order placed"
            );

            match injected {
                Some(Injected::DropAck(error)) => Err(error),
                _ => Ok(ack),
            }
        };
        outbox.deliver().await;
        result
    }

    async fn cancel_order(&self, _symbol: &str, exchange_order_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.state();
        let order = state
            .orders
            .get_mut(exchange_order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(exchange_order_id.to_string()))?;
        if order.status.is_terminal() {
            return Err(ExchangeError::Rejected {
                code: Some(-2011),
                reason: format!("Order {} is already {}", exchange_order_id, order.status),
            });
        }
        order.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn get_order_status(&self, _symbol: &str, order: OrderRef<'_>) -> Result<OrderAck, ExchangeError> {
        let state = self.state();
        let found = match order {
            OrderRef::Exchange(id) => state.order(id),
            OrderRef::Client(id) => state.order_by_client_id(id),
        };
        found.map(SimulatedOrder::ack).ok_or_else(|| {
            ExchangeError::OrderNotFound(match order {
                OrderRef::Exchange(id) | OrderRef::Client(id) => id.to_string(),
            })
        })
    }

    async fn get_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        Ok(self
            .state()
            .balances
            .values()
            .filter(|b| !b.total().is_zero())
            .cloned()
            .collect())
    }

    async fn get_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Bar>, ExchangeError> {
        let state = self.state();
        let bars = state
            .candles
            .get(&(symbol.to_string(), timeframe))
            .map(|bars| {
                let skip = bars.len().saturating_sub(limit);
                bars[skip..].to_vec()
            })
            .unwrap_or_default();
        Ok(bars)
    }

    async fn subscribe_market_data(
        &self,
        symbols: &[String],
        channels: &[MarketChannel],
        sink: mpsc::Sender<MarketEvent>,
    ) -> Result<SubscriptionHandle, ExchangeError> {
        let id = {
            let mut state = self.state();
            state.next_sub_id += 1;
            let id = state.next_sub_id;
            state.market_subs.push(MarketSubscription {
                id,
                symbols: symbols.iter().cloned().collect(),
                channels: channels.to_vec(),
                sink,
            });
            id
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = self.unsubscribe_on_shutdown(id, shutdown_rx);
        Ok(SubscriptionHandle::new(shutdown_tx, vec![task], self.status_channel("market_data")))
    }

    async fn subscribe_user_data(
        &self,
        orders: mpsc::Sender<OrderEvent>,
        positions: mpsc::Sender<PositionEvent>,
    ) -> Result<SubscriptionHandle, ExchangeError> {
        let id = {
            let mut state = self.state();
            state.next_sub_id += 1;
            let id = state.next_sub_id;
            state.user_subs.push(UserSubscription { id, orders, positions });
            id
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = self.unsubscribe_on_shutdown(id, shutdown_rx);
        Ok(SubscriptionHandle::new(shutdown_tx, vec![task], self.status_channel("user_data")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> SimulatedConnector {
        SimulatedConnector::new(SimulatedConfig {
            slippage_pct: Decimal::ZERO,
            ..SimulatedConfig::default()
        })
    }

    #[tokio::test]
    async fn test_market_buy_fills() {
        let sim = exchange();
        sim.set_price("BTCUSDT", dec!(50000)).await;

        let spec = OrderSpec::market("simulated", "BTCUSDT", Side::Buy, dec!(0.5));
        let ack = sim.place_order(&spec).await.unwrap();

        assert_eq!(ack.report.status, OrderStatus::Filled);
        assert_eq!(ack.report.avg_price, Some(dec!(50000)));
        assert_eq!(sim.state().balance("BTC"), dec!(0.5));
        assert_eq!(sim.state().balance("USDT"), dec!(75000));
    }

    #[tokio::test]
    async fn test_slippage_and_fees() {
        let sim = SimulatedConnector::new(SimulatedConfig {
            slippage_pct: dec!(0.1),
            fee_pct: dec!(0.1),
            ..SimulatedConfig::default()
        });
        sim.set_price("ETHUSDT", dec!(1000)).await;

        let ack = sim
            .place_order(&OrderSpec::market("simulated", "ETHUSDT", Side::Buy, dec!(10)))
            .await
            .unwrap();
        // 1000 * 1.001 = 1001, notional 10010 plus 10.01 fee
        assert_eq!(ack.report.avg_price, Some(dec!(1001)));
        assert_eq!(sim.state().balance("USDT"), dec!(89979.99));
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let sim = exchange();
        sim.set_price("BTCUSDT", dec!(50000)).await;

        let err = sim
            .place_order(&OrderSpec::market("simulated", "BTCUSDT", Side::Buy, dec!(3)))
            .await
            .unwrap_err();
        assert!(err.is_rejection());

        let err = sim
            .place_order(&OrderSpec::market("simulated", "BTCUSDT", Side::Sell, dec!(1)))
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(sim.state().order_count(), 0);
    }

    #[tokio::test]
    async fn test_resting_limit_fills_on_cross() {
        let sim = exchange();
        sim.set_price("BTCUSDT", dec!(50000)).await;

        let (orders_tx, mut orders_rx) = mpsc::channel(8);
        let (positions_tx, _positions_rx) = mpsc::channel(8);
        let _handle = sim.subscribe_user_data(orders_tx, positions_tx).await.unwrap();

        let spec = OrderSpec::limit("simulated", "BTCUSDT", Side::Buy, dec!(1), dec!(49000));
        let ack = sim.place_order(&spec).await.unwrap();
        assert_eq!(ack.report.status, OrderStatus::Open);

        sim.set_price("BTCUSDT", dec!(49500)).await;
        assert_eq!(sim.state().open_orders().len(), 1);

        sim.set_price("BTCUSDT", dec!(48900)).await;
        let event = orders_rx.recv().await.unwrap();
        assert_eq!(event.report.status, OrderStatus::Filled);
        assert_eq!(event.report.avg_price, Some(dec!(49000)));
        assert_eq!(event.client_order_id, Some(ack.client_order_id));
        assert!(sim.state().open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_partial_fill_and_cancel() {
        let sim = exchange();
        sim.set_price("BTCUSDT", dec!(50000)).await;
        let ack = sim
            .place_order(&OrderSpec::limit("simulated", "BTCUSDT", Side::Buy, dec!(2), dec!(40000)))
            .await
            .unwrap();

        let partial = sim.fill_order(&ack.exchange_order_id, dec!(0.5), dec!(40000)).await.unwrap();
        assert_eq!(partial.report.status, OrderStatus::PartiallyFilled);
        assert_eq!(partial.report.executed_qty, dec!(0.5));

        sim.cancel_order("BTCUSDT", &ack.exchange_order_id).await.unwrap();
        let status = sim
            .get_order_status("BTCUSDT", OrderRef::Exchange(&ack.exchange_order_id))
            .await
            .unwrap();
        assert_eq!(status.report.status, OrderStatus::Cancelled);
        assert_eq!(status.report.executed_qty, dec!(0.5));

        assert!(sim.cancel_order("BTCUSDT", &ack.exchange_order_id).await.unwrap_err().is_rejection());
    }

    #[tokio::test]
    async fn test_dropped_ack_is_found_by_client_id() {
        let sim = exchange();
        sim.set_price("BTCUSDT", dec!(50000)).await;
        sim.drop_next_ack(ExchangeError::Timeout(10_000));

        let spec = OrderSpec::market("simulated", "BTCUSDT", Side::Buy, dec!(0.1)).with_client_order_id("cid-1");
        assert_eq!(sim.place_order(&spec).await.unwrap_err(), ExchangeError::Timeout(10_000));

        let found = sim.get_order_status("BTCUSDT", OrderRef::Client("cid-1")).await.unwrap();
        assert_eq!(found.report.status, OrderStatus::Filled);

        // Resubmitting the same client id is refused
        assert!(sim.place_order(&spec).await.unwrap_err().is_rejection());
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_book_untouched() {
        let sim = exchange();
        sim.set_price("BTCUSDT", dec!(50000)).await;
        sim.fail_next_order(ExchangeError::Network("connection reset".into()));

        let spec = OrderSpec::market("simulated", "BTCUSDT", Side::Buy, dec!(0.1)).with_client_order_id("cid-2");
        assert!(sim.place_order(&spec).await.unwrap_err().is_transient());
        assert!(matches!(
            sim.get_order_status("BTCUSDT", OrderRef::Client("cid-2")).await,
            Err(ExchangeError::OrderNotFound(_))
        ));
        assert!(sim.place_order(&spec).await.is_ok());
    }

    #[tokio::test]
    async fn test_market_stream_and_unsubscribe() {
        let sim = exchange();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = sim
            .subscribe_market_data(&["BTCUSDT".to_string()], &[MarketChannel::Trades], tx)
            .await
            .unwrap();

        sim.set_price("ETHUSDT", dec!(3000)).await;
        sim.set_price("BTCUSDT", dec!(51000)).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.symbol(), "BTCUSDT");
        assert_eq!(event.last_price(), Some(dec!(51000)));

        handle.shutdown().await;
        sim.set_price("BTCUSDT", dec!(52000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_candles_and_balances() {
        let sim = exchange();
        let bars: Vec<Bar> = (0..5)
            .map(|i| Bar::new(i * 3_600_000, 100.0, 101.0, 99.0, 100.0 + i as f64, 1.0))
            .collect();
        sim.load_candles("BTCUSDT", Timeframe::Hour1, bars);

        let last = sim.get_candles("BTCUSDT", Timeframe::Hour1, 2).await.unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[1].close, 104.0);
        assert!(sim.get_candles("BTCUSDT", Timeframe::Daily, 2).await.unwrap().is_empty());
        assert_eq!(sim.state().price("BTCUSDT"), Some(dec!(104)));

        let balances = sim.get_balances().await.unwrap();
        assert_eq!(balances, vec![Balance::new("USDT", dec!(100000), Decimal::ZERO)]);
    }
}

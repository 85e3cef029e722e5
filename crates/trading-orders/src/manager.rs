//! Order manager: risk gate, submission, execution tracking and positions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use trading_core::error::{ExchangeError, OrderStateError};
use trading_core::traits::{AlertSink, OrderRef, SubscriptionHandle};
use trading_core::types::{
    Alert, AlertSeverity, ExecutionReport, Order, OrderEvent, OrderSpec, OrderStatus, Position,
    PositionBook, StreamStatusEvent,
};
use trading_exchange::ExchangeManager;
use trading_risk::{RiskDecision, RiskManager};
use uuid::Uuid;

use crate::error::OrderError;
use crate::statistics::AgentStatistics;

/// Order manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderManagerConfig {
    /// Period of the background status sync
    pub sync_interval_ms: u64,
    /// Capacity of the user-stream event channels
    pub event_buffer: usize,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 5_000,
            event_buffer: 256,
        }
    }
}

/// Selection for [`OrderManager::list_orders`]. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub account: Option<String>,
    pub agent_id: Option<String>,
    pub exchange: Option<String>,
    pub symbol: Option<String>,
    pub status: Option<OrderStatus>,
    pub active_only: bool,
}

impl OrderFilter {
    pub fn for_account(account: impl Into<String>) -> Self {
        Self {
            account: Some(account.into()),
            ..Self::default()
        }
    }

    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn active(mut self) -> Self {
        self.active_only = true;
        self
    }

    fn matches(&self, order: &Order) -> bool {
        self.account.as_ref().map_or(true, |a| &order.account == a)
            && self
                .agent_id
                .as_ref()
                .map_or(true, |a| order.agent_id.as_ref() == Some(a))
            && self.exchange.as_ref().map_or(true, |e| &order.exchange == e)
            && self.symbol.as_ref().map_or(true, |s| &order.symbol == s)
            && self.status.map_or(true, |s| order.status == s)
            && (!self.active_only || order.status.is_active())
    }
}

#[derive(Debug, Default)]
struct OrderBook {
    orders: HashMap<Uuid, Order>,
    /// (exchange, client order id)
    by_client_id: HashMap<(String, String), Uuid>,
    /// (exchange, exchange order id)
    by_exchange_id: HashMap<(String, String), Uuid>,
    agent_realized: HashMap<String, Decimal>,
}

impl OrderBook {
    fn insert(&mut self, order: Order) {
        self.by_client_id
            .insert((order.exchange.clone(), order.client_order_id.clone()), order.id);
        if let Some(tx_id) = &order.tx_id {
            self.by_exchange_id
                .insert((order.exchange.clone(), tx_id.clone()), order.id);
        }
        self.orders.insert(order.id, order);
    }

    fn lookup(&self, exchange: &str, exchange_order_id: Option<&str>, client_order_id: Option<&str>) -> Option<Uuid> {
        exchange_order_id
            .and_then(|id| self.by_exchange_id.get(&(exchange.to_string(), id.to_string())))
            .or_else(|| {
                client_order_id.and_then(|id| self.by_client_id.get(&(exchange.to_string(), id.to_string())))
            })
            .copied()
    }
}

/// Tracks every order from request to terminal state.
///
/// Orders and the positions their fills produce are updated under one lock,
/// so fills for the same (account, symbol) arriving from REST sync and the
/// user stream are applied one at a time and only once.
pub struct OrderManager {
    config: OrderManagerConfig,
    exchanges: Arc<ExchangeManager>,
    risk: Arc<RiskManager>,
    positions: Arc<PositionBook>,
    book: Mutex<OrderBook>,
    alerts: Option<Arc<dyn AlertSink>>,
    /// `true` while accepting orders; submissions hold a read guard
    gate: RwLock<bool>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl OrderManager {
    pub fn new(
        config: OrderManagerConfig,
        exchanges: Arc<ExchangeManager>,
        risk: Arc<RiskManager>,
        positions: Arc<PositionBook>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            exchanges,
            risk,
            positions,
            book: Mutex::new(OrderBook::default()),
            alerts: None,
            gate: RwLock::new(true),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_alerts(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(sink);
        self
    }

    pub fn exchanges(&self) -> &Arc<ExchangeManager> {
        &self.exchanges
    }

    pub fn positions(&self) -> &Arc<PositionBook> {
        &self.positions
    }

    fn book(&self) -> MutexGuard<'_, OrderBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn alert(&self, severity: AlertSeverity, account: &str, message: String) {
        if let Some(sink) = &self.alerts {
            sink.send_alert(Alert::new(severity, "order_manager", message).for_account(account))
                .await;
        }
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut Order)) -> Option<Order> {
        let mut book = self.book();
        let order = book.orders.get_mut(&id)?;
        f(order);
        Some(order.clone())
    }

    /// Apply an execution report to order `id` and book any new fill.
    /// Must be called with the book lock held.
    fn apply_locked(
        &self,
        book: &mut OrderBook,
        id: Uuid,
        exchange_order_id: Option<&str>,
        report: &ExecutionReport,
    ) -> Result<Order, OrderError> {
        let OrderBook {
            orders,
            by_exchange_id,
            agent_realized,
            ..
        } = book;
        let order = orders.get_mut(&id).ok_or(OrderError::NotFound(id))?;

        if order.tx_id.is_none() {
            if let Some(tx_id) = exchange_order_id {
                order.tx_id = Some(tx_id.to_string());
                by_exchange_id.insert((order.exchange.clone(), tx_id.to_string()), id);
            }
        }

        let previous = order.status;
        let fill = match order.apply_report(report) {
            Ok(fill) => fill,
            Err(OrderStateError::Terminal(status)) => {
                debug!(order_id = %id, %status, "Report for finished order ignored");
                return Ok(order.clone());
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(fill) = fill {
            let change = self
                .positions
                .apply_fill(&order.account, order.agent_id.as_deref(), &order.symbol, &fill);
            if let Some(agent) = &order.agent_id {
                *agent_realized.entry(agent.clone()).or_insert(Decimal::ZERO) += change.realized;
            }
            info!(
                order_id = %id,
                symbol = %order.symbol,
                side = %fill.side,
                quantity = %fill.quantity,
                price = %fill.price,
                position = %change.position.as_ref().map(|p| p.quantity).unwrap_or(Decimal::ZERO),
                "Fill applied"
            );
        }
        if order.status != previous {
            info!(order_id = %id, from = %previous, to = %order.status, "Order status changed");
        }
        Ok(order.clone())
    }

    /// Validate, risk-check and submit a new order.
    ///
    /// Risk and exchange rejections are recorded as `Rejected` orders and
    /// returned as errors carrying the order id. A submission whose outcome
    /// is unknown returns the order still `Pending` with
    /// `submission_uncertain` set; [`OrderManager::sync_status`] resolves it.
    pub async fn create_order(&self, account: &str, spec: OrderSpec) -> Result<Order, OrderError> {
        if account.trim().is_empty() {
            return Err(OrderError::Validation("account is empty".into()));
        }
        spec.validate().map_err(OrderError::Validation)?;
        self.exchanges.get(&spec.exchange)?;

        let gate = self.gate.read().await;
        if !*gate {
            return Err(OrderError::ShuttingDown);
        }

        let order = Order::new(account, &spec);
        let id = order.id;
        {
            let mut book = self.book();
            let key = (order.exchange.clone(), order.client_order_id.clone());
            if book.by_client_id.contains_key(&key) {
                return Err(OrderError::Validation(format!(
                    "client order id {} already used on {}",
                    order.client_order_id, order.exchange
                )));
            }
            book.insert(order.clone());
        }

        let decision = self.risk.validate_order(account, &spec).await;
        match &decision {
            RiskDecision::Rejected { reason } => {
                warn!(order_id = %id, account, symbol = %spec.symbol, reason = %reason, "Order blocked by risk");
                self.update(id, |o| o.reject(reason.clone()));
                self.alert(
                    AlertSeverity::Warning,
                    account,
                    format!("{} {} {} blocked: {}", spec.side, spec.quantity, spec.symbol, reason),
                )
                .await;
                return Err(OrderError::RiskRejected {
                    order_id: id,
                    reason: reason.clone(),
                });
            }
            RiskDecision::Allowed { warning: Some(warning) } => {
                warn!(order_id = %id, warning = %warning, "Order allowed without a complete risk check");
            }
            RiskDecision::Allowed { warning: None } => {}
        }

        info!(
            order_id = %id,
            account,
            exchange = %spec.exchange,
            symbol = %spec.symbol,
            side = %spec.side,
            order_type = %spec.order_type,
            quantity = %spec.quantity,
            "Submitting order"
        );
        let submitted = self.exchanges.place_order(&order.spec()).await;
        let result = match submitted {
            Ok(ack) => {
                let mut book = self.book();
                match self.apply_locked(&mut book, id, Some(&ack.exchange_order_id), &ack.report) {
                    Ok(order) => Ok(order),
                    Err(e) => {
                        error!(order_id = %id, "Acknowledgement not applied: {}", e);
                        book.orders.get(&id).cloned().ok_or(OrderError::NotFound(id))
                    }
                }
            }
            Err(e) if e.is_transient() || matches!(e, ExchangeError::Decode(_)) => {
                warn!(order_id = %id, "Submission outcome unknown: {}", e);
                let order = self
                    .update(id, |o| o.submission_uncertain = true)
                    .ok_or(OrderError::NotFound(id))?;
                self.alert(
                    AlertSeverity::Warning,
                    account,
                    format!("order {} submission uncertain: {}", order.client_order_id, e),
                )
                .await;
                Ok(order)
            }
            Err(e) => {
                let reason = match &e {
                    ExchangeError::Rejected { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                warn!(order_id = %id, reason = %reason, "Order rejected by exchange");
                self.update(id, |o| o.reject(reason.clone()));
                self.alert(
                    AlertSeverity::Warning,
                    account,
                    format!("{} {} {} rejected: {}", spec.side, spec.quantity, spec.symbol, reason),
                )
                .await;
                Err(OrderError::ExchangeRejected { order_id: id, reason })
            }
        };
        drop(gate);
        result
    }

    fn order_for(&self, account: &str, id: Uuid) -> Result<Order, OrderError> {
        self.book()
            .orders
            .get(&id)
            .filter(|o| o.account == account)
            .cloned()
            .ok_or(OrderError::NotFound(id))
    }

    /// Cancel a live order and return its final state.
    pub async fn cancel_order(&self, account: &str, id: Uuid) -> Result<Order, OrderError> {
        let order = self.order_for(account, id)?;
        if order.is_terminal() {
            return Err(OrderError::InvalidState {
                order_id: id,
                status: order.status,
            });
        }
        let Some(tx_id) = order.tx_id.clone() else {
            return Err(OrderError::NotSubmitted(id));
        };

        match self.exchanges.cancel_order(&order.exchange, &order.symbol, &tx_id).await {
            Ok(()) => {}
            Err(e) if e.is_rejection() || matches!(e, ExchangeError::OrderNotFound(_)) => {
                // Already finished on the exchange; adopt its state
                warn!(order_id = %id, "Cancel refused: {}", e);
                return self.sync_status(account, id).await;
            }
            Err(e) => return Err(e.into()),
        }
        info!(order_id = %id, "Order cancelled");

        match self.sync_status(account, id).await {
            Ok(order) if order.is_terminal() => Ok(order),
            _ => {
                let mut book = self.book();
                let current = book.orders.get(&id).cloned().ok_or(OrderError::NotFound(id))?;
                let report = ExecutionReport::new(
                    OrderStatus::Cancelled,
                    current.executed_qty,
                    current.avg_fill_price,
                );
                self.apply_locked(&mut book, id, None, &report)
            }
        }
    }

    /// Refresh one order from the exchange.
    ///
    /// An uncertain submission is looked up by client order id: if the
    /// exchange has it the order adopts its state, otherwise it is rejected.
    /// A submission still in flight is returned unchanged.
    pub async fn sync_status(&self, account: &str, id: Uuid) -> Result<Order, OrderError> {
        let order = self.order_for(account, id)?;
        if order.is_terminal() || (order.tx_id.is_none() && !order.submission_uncertain) {
            return Ok(order);
        }

        let lookup = match &order.tx_id {
            Some(tx_id) => OrderRef::Exchange(tx_id),
            None => OrderRef::Client(&order.client_order_id),
        };
        match self.exchanges.get_order_status(&order.exchange, &order.symbol, lookup).await {
            Ok(ack) => {
                let mut book = self.book();
                self.apply_locked(&mut book, id, Some(&ack.exchange_order_id), &ack.report)
            }
            Err(ExchangeError::OrderNotFound(_)) if order.tx_id.is_none() => {
                let reason = "not found on exchange after uncertain submission";
                warn!(order_id = %id, client_order_id = %order.client_order_id, "Order {}", reason);
                let order = self
                    .update(id, |o| o.reject(reason))
                    .ok_or(OrderError::NotFound(id))?;
                self.alert(
                    AlertSeverity::Warning,
                    account,
                    format!("order {} {}", order.client_order_id, reason),
                )
                .await;
                Ok(order)
            }
            Err(e) => {
                debug!(order_id = %id, "Status sync failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Sync every order that is live or uncertain. Returns how many changed.
    pub async fn sync_open_orders(&self) -> usize {
        let pending: Vec<(String, Uuid, OrderStatus)> = self
            .book()
            .orders
            .values()
            .filter(|o| o.status.is_active() && (o.tx_id.is_some() || o.submission_uncertain))
            .map(|o| (o.account.clone(), o.id, o.status))
            .collect();

        let mut changed = 0;
        for (account, id, before) in pending {
            match self.sync_status(&account, id).await {
                Ok(order) if order.status != before => changed += 1,
                Ok(_) => {}
                Err(e) => warn!(order_id = %id, "Status sync failed: {}", e),
            }
        }
        changed
    }

    /// Apply an execution update from a user-data stream. Returns the
    /// updated order, or `None` for orders this manager does not track.
    pub async fn handle_order_event(&self, event: OrderEvent) -> Option<Order> {
        let (order, newly_rejected) = {
            let mut book = self.book();
            let Some(id) = book.lookup(
                &event.exchange,
                event.exchange_order_id.as_deref(),
                event.client_order_id.as_deref(),
            ) else {
                debug!(
                    exchange = %event.exchange,
                    exchange_order_id = ?event.exchange_order_id,
                    "Event for untracked order"
                );
                return None;
            };
            let previous = book.orders.get(&id).map(|o| o.status);
            match self.apply_locked(&mut book, id, event.exchange_order_id.as_deref(), &event.report) {
                Ok(order) => {
                    let rejected = order.status == OrderStatus::Rejected && previous != Some(OrderStatus::Rejected);
                    (order, rejected)
                }
                Err(e) => {
                    warn!(order_id = %id, "Order event not applied: {}", e);
                    return None;
                }
            }
        };
        if newly_rejected {
            self.alert(
                AlertSeverity::Warning,
                &order.account,
                format!(
                    "order {} rejected: {}",
                    order.client_order_id,
                    order.reject_reason.as_deref().unwrap_or("unknown")
                ),
            )
            .await;
        }
        Some(order)
    }

    pub fn get_order(&self, id: Uuid) -> Option<Order> {
        self.book().orders.get(&id).cloned()
    }

    pub fn get_order_by_client_id(&self, exchange: &str, client_order_id: &str) -> Option<Order> {
        let book = self.book();
        let id = book.lookup(exchange, None, Some(client_order_id))?;
        book.orders.get(&id).cloned()
    }

    pub fn get_position(&self, account: &str, symbol: &str) -> Option<Position> {
        self.positions.get(account, symbol)
    }

    /// Orders matching `filter`, oldest first.
    pub fn list_orders(&self, filter: &OrderFilter) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .book()
            .orders
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        orders
    }

    pub fn agent_statistics(&self, agent_id: &str) -> AgentStatistics {
        let (orders, realized) = {
            let book = self.book();
            let orders: Vec<Order> = book
                .orders
                .values()
                .filter(|o| o.agent_id.as_deref() == Some(agent_id))
                .cloned()
                .collect();
            let realized = book.agent_realized.get(agent_id).copied().unwrap_or(Decimal::ZERO);
            (orders, realized)
        };
        let positions = self
            .positions
            .all()
            .into_iter()
            .filter(|p| p.agent_id.as_deref() == Some(agent_id))
            .collect();
        AgentStatistics::from_orders(agent_id, &orders, realized, positions)
    }

    pub async fn is_accepting(&self) -> bool {
        *self.gate.read().await
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<SubscriptionHandle>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the periodic status sync.
    pub fn start_status_sync(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = Duration::from_millis(self.config.sync_interval_ms.max(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let changed = manager.sync_open_orders().await;
                        if changed > 0 {
                            debug!(changed, "Status sync updated orders");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Status sync stopped");
        });
        self.tasks().push(task);
    }

    /// Subscribe to `exchange`'s user-data stream and apply its execution
    /// updates as they arrive.
    pub async fn listen_user_data(self: &Arc<Self>, exchange: &str) -> Result<(), OrderError> {
        let connector = self.exchanges.get(exchange)?;
        let (order_tx, mut order_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (position_tx, mut position_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let mut handle = connector.subscribe_user_data(order_tx, position_tx).await?;
        let mut status_rx = handle.take_status_receiver();

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let exchange_id = exchange.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = order_rx.recv() => match event {
                        Some(event) => {
                            manager.handle_order_event(event).await;
                        }
                        None => break,
                    },
                    Some(balance) = position_rx.recv() => {
                        debug!(exchange = %balance.exchange, asset = %balance.asset, free = %balance.free, "Balance update");
                    }
                    Some(status) = next_status(&mut status_rx) => {
                        manager.exchanges.record_stream_status(&status);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(exchange = %exchange_id, "User-data listener stopped");
        });

        info!(exchange, "Listening for user-data updates");
        self.subscriptions().push(handle);
        self.tasks().push(task);
        Ok(())
    }

    /// Stop accepting orders, wait for in-flight submissions, then stop the
    /// background tasks and streams.
    pub async fn shutdown(&self) {
        info!("Order manager stopping, waiting for in-flight submissions");
        *self.gate.write().await = false;
        let _ = self.shutdown_tx.send(true);

        let subscriptions: Vec<SubscriptionHandle> = std::mem::take(&mut *self.subscriptions());
        for handle in subscriptions {
            handle.shutdown().await;
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Order manager stopped");
    }
}

async fn next_status(rx: &mut Option<mpsc::Receiver<StreamStatusEvent>>) -> Option<StreamStatusEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use trading_core::types::{Balance, Side};
    use trading_data::{InMemoryTradingData, PriceCache};
    use trading_exchange::{SimulatedConfig, SimulatedConnector};
    use trading_risk::RiskConfig;

    struct Harness {
        manager: Arc<OrderManager>,
        exchange: Arc<SimulatedConnector>,
        prices: Arc<PriceCache>,
    }

    impl Harness {
        async fn set_price(&self, price: Decimal) {
            self.prices.set("BTCUSDT", price);
            self.exchange.set_price("BTCUSDT", price).await;
        }
    }

    async fn harness() -> Harness {
        let exchange = Arc::new(SimulatedConnector::new(SimulatedConfig {
            id: "sim".into(),
            slippage_pct: Decimal::ZERO,
            ..SimulatedConfig::default()
        }));
        let mut exchanges = ExchangeManager::new();
        exchanges.register(exchange.clone()).unwrap();

        let positions = Arc::new(PositionBook::new());
        let prices = Arc::new(PriceCache::new());
        let data = Arc::new(InMemoryTradingData::new(prices.clone(), positions.clone()));
        data.set_balances("acct", vec![Balance::new("USDT", dec!(100000), Decimal::ZERO)]);
        let risk = Arc::new(RiskManager::new(RiskConfig::default(), data, positions.clone()));
        let manager = Arc::new(OrderManager::new(
            OrderManagerConfig::default(),
            Arc::new(exchanges),
            risk,
            positions,
        ));

        let harness = Harness { manager, exchange, prices };
        harness.set_price(dec!(100)).await;
        harness
    }

    fn buy(quantity: Decimal) -> OrderSpec {
        OrderSpec::market("sim", "BTCUSDT", Side::Buy, quantity)
    }

    fn sell(quantity: Decimal) -> OrderSpec {
        OrderSpec::market("sim", "BTCUSDT", Side::Sell, quantity)
    }

    #[tokio::test]
    async fn test_market_order_fills_and_opens_position() {
        let h = harness().await;
        let order = h.manager.create_order("acct", buy(dec!(2))).await.unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.executed_qty, dec!(2));
        assert!(order.tx_id.is_some());

        let position = h.manager.get_position("acct", "BTCUSDT").unwrap();
        assert_eq!(position.quantity, dec!(2));
        assert_eq!(position.avg_price, dec!(100));
    }

    #[tokio::test]
    async fn test_weighted_average_and_removal() {
        let h = harness().await;
        h.manager.create_order("acct", buy(dec!(1))).await.unwrap();
        h.set_price(dec!(110)).await;
        h.manager.create_order("acct", buy(dec!(1))).await.unwrap();

        let position = h.manager.get_position("acct", "BTCUSDT").unwrap();
        assert_eq!(position.quantity, dec!(2));
        assert_eq!(position.avg_price, dec!(105));

        h.set_price(dec!(120)).await;
        let order = h.manager.create_order("acct", sell(dec!(2))).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(h.manager.get_position("acct", "BTCUSDT").is_none());
        assert_eq!(
            h.manager.positions().realized_pnl("acct", Utc::now().date_naive()),
            dec!(30)
        );
    }

    #[tokio::test]
    async fn test_risk_rejection_never_reaches_exchange() {
        let h = harness().await;
        // 200 × 100 = 20% of the account, above the 10% default
        let err = h.manager.create_order("acct", buy(dec!(200))).await.unwrap_err();

        let OrderError::RiskRejected { order_id, reason } = err else {
            panic!("expected risk rejection, got {:?}", err);
        };
        assert!(!reason.is_empty());
        assert_eq!(h.exchange.state().order_count(), 0);

        let order = h.manager.get_order(order_id).unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.reject_reason.as_deref(), Some(reason.as_str()));
    }

    #[tokio::test]
    async fn test_exchange_rejection_recorded() {
        let h = harness().await;
        // No price for BTCEUR: risk fails open, the exchange refuses the symbol
        let spec = OrderSpec::market("sim", "BTCEUR", Side::Buy, dec!(1));
        let err = h.manager.create_order("acct", spec).await.unwrap_err();

        let OrderError::ExchangeRejected { order_id, reason } = err else {
            panic!("expected exchange rejection, got {:?}", err);
        };
        assert!(reason.contains("Invalid symbol"));
        assert_eq!(h.manager.get_order(order_id).unwrap().status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_contract_errors_before_network() {
        let h = harness().await;
        assert!(matches!(
            h.manager.create_order("acct", buy(dec!(-1))).await,
            Err(OrderError::Validation(_))
        ));
        let unknown = OrderSpec::market("kraken", "BTCUSDT", Side::Buy, dec!(1));
        assert!(matches!(
            h.manager.create_order("acct", unknown).await,
            Err(OrderError::Exchange(ExchangeError::UnknownExchange(_)))
        ));
        assert_eq!(h.exchange.state().order_count(), 0);
        assert!(h.manager.list_orders(&OrderFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_fill_applied_once() {
        let h = harness().await;
        let spec = OrderSpec::limit("sim", "BTCUSDT", Side::Buy, dec!(4), dec!(90));
        let order = h.manager.create_order("acct", spec).await.unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        let tx_id = order.tx_id.clone().unwrap();

        let ack = h.exchange.fill_order(&tx_id, dec!(1), dec!(90)).await.unwrap();
        let synced = h.manager.sync_status("acct", order.id).await.unwrap();
        assert_eq!(synced.status, OrderStatus::PartiallyFilled);

        // Same cumulative quantity again from the stream
        let event = OrderEvent {
            exchange: "sim".into(),
            symbol: "BTCUSDT".into(),
            exchange_order_id: Some(tx_id.clone()),
            client_order_id: None,
            report: ack.report.clone(),
            timestamp: Utc::now(),
        };
        h.manager.handle_order_event(event.clone()).await.unwrap();
        assert_eq!(h.manager.get_position("acct", "BTCUSDT").unwrap().quantity, dec!(1));

        let ack = h.exchange.fill_order(&tx_id, dec!(3), dec!(90)).await.unwrap();
        let done = h
            .manager
            .handle_order_event(OrderEvent { report: ack.report, ..event })
            .await
            .unwrap();
        assert_eq!(done.status, OrderStatus::Filled);
        assert_eq!(done.executed_qty, dec!(4));
        assert_eq!(h.manager.get_position("acct", "BTCUSDT").unwrap().quantity, dec!(4));
    }

    #[tokio::test]
    async fn test_uncertain_submission_adopts_exchange_state() {
        let h = harness().await;
        h.exchange.drop_next_ack(ExchangeError::Timeout(10_000));

        let order = h.manager.create_order("acct", buy(dec!(1))).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.submission_uncertain);
        assert!(order.tx_id.is_none());

        let resolved = h.manager.sync_status("acct", order.id).await.unwrap();
        assert_eq!(resolved.status, OrderStatus::Filled);
        assert!(!resolved.submission_uncertain);
        assert!(resolved.tx_id.is_some());
        assert_eq!(h.manager.get_position("acct", "BTCUSDT").unwrap().quantity, dec!(1));
    }

    #[tokio::test]
    async fn test_uncertain_submission_not_found_is_rejected() {
        let h = harness().await;
        h.exchange.fail_next_order(ExchangeError::Network("connection reset".into()));

        let order = h.manager.create_order("acct", buy(dec!(1))).await.unwrap();
        assert!(order.submission_uncertain);

        assert_eq!(h.manager.sync_open_orders().await, 1);
        let resolved = h.manager.get_order(order.id).unwrap();
        assert_eq!(resolved.status, OrderStatus::Rejected);
        assert!(resolved.reject_reason.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_cancel_resting_order() {
        let h = harness().await;
        let spec = OrderSpec::limit("sim", "BTCUSDT", Side::Buy, dec!(1), dec!(50));
        let order = h.manager.create_order("acct", spec).await.unwrap();

        let cancelled = h.manager.cancel_order("acct", order.id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);

        assert!(matches!(
            h.manager.cancel_order("acct", order.id).await,
            Err(OrderError::InvalidState { status: OrderStatus::Cancelled, .. })
        ));
        assert!(matches!(
            h.manager.cancel_order("other", order.id).await,
            Err(OrderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_user_stream_fills_resting_order() {
        let h = harness().await;
        h.manager.listen_user_data("sim").await.unwrap();

        let spec = OrderSpec::limit("sim", "BTCUSDT", Side::Buy, dec!(1), dec!(90));
        let order = h.manager.create_order("acct", spec).await.unwrap();
        assert_eq!(order.status, OrderStatus::Open);

        h.set_price(dec!(89)).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.manager.get_order(order.id).map(|o| o.status) != Some(OrderStatus::Filled) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("fill event not applied");

        let position = h.manager.get_position("acct", "BTCUSDT").unwrap();
        assert_eq!(position.avg_price, dec!(90));
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_orders() {
        let h = harness().await;
        h.manager.start_status_sync();
        h.manager.shutdown().await;

        assert!(!h.manager.is_accepting().await);
        assert_eq!(
            h.manager.create_order("acct", buy(dec!(1))).await,
            Err(OrderError::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn test_list_orders_and_agent_statistics() {
        let h = harness().await;
        h.manager
            .create_order("acct", buy(dec!(1)).with_agent("alpha"))
            .await
            .unwrap();
        h.set_price(dec!(110)).await;
        h.manager
            .create_order("acct", sell(dec!(1)).with_agent("alpha"))
            .await
            .unwrap();
        let _ = h.manager.create_order("acct", buy(dec!(500)).with_agent("alpha")).await;
        h.manager.create_order("acct", buy(dec!(1)).with_agent("beta")).await.unwrap();

        assert_eq!(h.manager.list_orders(&OrderFilter::for_agent("alpha")).len(), 3);
        assert_eq!(h.manager.list_orders(&OrderFilter::for_account("acct")).len(), 4);
        assert!(h.manager.list_orders(&OrderFilter::for_account("acct").active()).is_empty());

        let stats = h.manager.agent_statistics("alpha");
        assert_eq!(stats.total_orders, 3);
        assert_eq!(stats.filled_orders, 2);
        assert_eq!(stats.rejected_orders, 1);
        assert_eq!(stats.realized_pnl, dec!(10));
        assert!(stats.open_positions.is_empty());

        let beta = h.manager.agent_statistics("beta");
        assert_eq!(beta.open_positions.len(), 1);
    }
}

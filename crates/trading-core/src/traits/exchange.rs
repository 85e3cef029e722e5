//! Exchange connector trait definition.

use crate::error::ExchangeError;
use crate::types::{
    Balance, Bar, ExecutionReport, MarketChannel, MarketEvent, OrderEvent, OrderSpec,
    PositionEvent, StreamStatusEvent, Timeframe,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Exchange acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub client_order_id: String,
    /// State at acknowledgement (market orders may already be filled)
    pub report: ExecutionReport,
}

/// How to look an order up on the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderRef<'a> {
    Exchange(&'a str),
    Client(&'a str),
}

/// Running stream tasks started by a subscription.
///
/// Call [`SubscriptionHandle::shutdown`] to stop the tasks and wait for
/// their sockets to close. Dropping the handle also stops them, without
/// waiting.
#[derive(Debug)]
pub struct SubscriptionHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    status: Option<mpsc::Receiver<StreamStatusEvent>>,
}

impl SubscriptionHandle {
    pub fn new(
        shutdown: watch::Sender<bool>,
        tasks: Vec<JoinHandle<()>>,
        status: mpsc::Receiver<StreamStatusEvent>,
    ) -> Self {
        Self {
            shutdown,
            tasks,
            status: Some(status),
        }
    }

    /// Take the receiver of stream status changes (connected, reconnecting,
    /// failed). Returns `None` once taken.
    pub fn take_status_receiver(&mut self) -> Option<mpsc::Receiver<StreamStatusEvent>> {
        self.status.take()
    }

    pub fn stream_count(&self) -> usize {
        self.tasks.len()
    }

    /// Whether every stream task has exited.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }

    /// Signal every stream task to stop and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Uniform interface to one exchange.
///
/// Implementations route every outbound call through their rate limiter,
/// apply a per-call timeout, sign state-changing requests, and retry
/// transient failures with backoff.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Exchange id, e.g. "binance".
    fn id(&self) -> &str;

    /// Validate credentials and connectivity.
    async fn connect(&self) -> Result<(), ExchangeError>;

    /// Stop background activity owned by the connector.
    async fn disconnect(&self) -> Result<(), ExchangeError>;

    async fn place_order(&self, spec: &OrderSpec) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<(), ExchangeError>;

    async fn get_order_status(
        &self,
        symbol: &str,
        order: OrderRef<'_>,
    ) -> Result<OrderAck, ExchangeError>;

    async fn get_balances(&self) -> Result<Vec<Balance>, ExchangeError>;

    /// Most recent candles, oldest first.
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError>;

    /// One supervised stream per (symbol, channel), delivering into `sink`.
    async fn subscribe_market_data(
        &self,
        symbols: &[String],
        channels: &[MarketChannel],
        sink: mpsc::Sender<MarketEvent>,
    ) -> Result<SubscriptionHandle, ExchangeError>;

    /// Order executions and balance changes for the connector's account.
    async fn subscribe_user_data(
        &self,
        orders: mpsc::Sender<OrderEvent>,
        positions: mpsc::Sender<PositionEvent>,
    ) -> Result<SubscriptionHandle, ExchangeError>;
}

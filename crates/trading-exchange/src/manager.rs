//! Connector registry with per-exchange health tracking.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use trading_core::error::ExchangeError;
use trading_core::traits::{ExchangeConnector, OrderAck, OrderRef};
use trading_core::types::{Balance, Bar, OrderSpec, StreamStatus, StreamStatusEvent, Timeframe};

use crate::registry::ExchangeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Recent transient failures, or a stream fell back to polling
    Degraded,
    /// Unusable until a reconnect succeeds
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorHealth {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ConnectorHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Owns the configured connectors and routes calls to them by exchange id,
/// recording each call's outcome as connector health.
pub struct ExchangeManager {
    connectors: BTreeMap<String, Arc<dyn ExchangeConnector>>,
    health: DashMap<String, ConnectorHealth>,
    /// Consecutive transient failures before a connector is marked down
    down_after: u32,
}

impl Default for ExchangeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeManager {
    pub fn new() -> Self {
        Self {
            connectors: BTreeMap::new(),
            health: DashMap::new(),
            down_after: 3,
        }
    }

    pub fn with_down_after(mut self, failures: u32) -> Self {
        self.down_after = failures.max(1);
        self
    }

    /// Build and register every enabled exchange in `configs`.
    pub fn from_configs(configs: &[ExchangeConfig]) -> Result<Self, ExchangeError> {
        let mut manager = Self::new();
        for config in configs.iter().filter(|c| c.enabled) {
            manager.register(config.build()?)?;
        }
        Ok(manager)
    }

    pub fn register(&mut self, connector: Arc<dyn ExchangeConnector>) -> Result<(), ExchangeError> {
        let id = connector.id().to_string();
        if self.connectors.contains_key(&id) {
            return Err(ExchangeError::Configuration(format!("exchange {} registered twice", id)));
        }
        info!(exchange = %id, "Registered exchange connector");
        self.health.insert(id.clone(), ConnectorHealth::default());
        self.connectors.insert(id, connector);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn ExchangeConnector>, ExchangeError> {
        self.connectors
            .get(id)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownExchange(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn health(&self, id: &str) -> Option<ConnectorHealth> {
        self.health.get(id).map(|h| h.clone())
    }

    pub fn health_report(&self) -> BTreeMap<String, ConnectorHealth> {
        self.health
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn is_available(&self, id: &str) -> bool {
        self.health
            .get(id)
            .map(|h| h.status != HealthStatus::Down)
            .unwrap_or(false)
    }

    pub fn record_success(&self, id: &str) {
        if let Some(mut health) = self.health.get_mut(id) {
            if health.status != HealthStatus::Healthy {
                info!(exchange = id, "Exchange healthy again");
            }
            *health = ConnectorHealth::default();
        }
    }

    /// Fold a failed call into the connector's health. Order rejects and
    /// bad requests say nothing about the connection and are ignored.
    pub fn record_failure(&self, id: &str, failure: &ExchangeError) {
        let Some(mut health) = self.health.get_mut(id) else {
            return;
        };
        let next = if failure.is_fatal() {
            HealthStatus::Down
        } else if failure.is_transient() {
            health.consecutive_failures += 1;
            if health.consecutive_failures >= self.down_after {
                HealthStatus::Down
            } else {
                HealthStatus::Degraded
            }
        } else {
            return;
        };

        if next != health.status {
            match next {
                HealthStatus::Down => error!(exchange = id, error = %failure, "Exchange marked down"),
                _ => warn!(exchange = id, error = %failure, "Exchange degraded"),
            }
        }
        health.status = next;
        health.last_error = Some(failure.to_string());
        health.updated_at = Utc::now();
    }

    /// Streams that gave up reconnecting degrade their connector.
    pub fn record_stream_status(&self, event: &StreamStatusEvent) {
        if let StreamStatus::StreamFailed { reason } = &event.status {
            if let Some(mut health) = self.health.get_mut(&event.exchange) {
                warn!(exchange = %event.exchange, stream = %event.stream, reason, "Stream failed, polling only");
                if health.status == HealthStatus::Healthy {
                    health.status = HealthStatus::Degraded;
                }
                health.last_error = Some(format!("stream {} failed: {}", event.stream, reason));
                health.updated_at = Utc::now();
            }
        }
    }

    fn track<T>(&self, id: &str, result: Result<T, ExchangeError>) -> Result<T, ExchangeError> {
        match &result {
            Ok(_) => self.record_success(id),
            Err(e) => self.record_failure(id, e),
        }
        result
    }

    /// Connect every connector; failures mark the connector down.
    pub async fn connect_all(&self) -> BTreeMap<String, Result<(), ExchangeError>> {
        let mut results = BTreeMap::new();
        for (id, connector) in &self.connectors {
            let result = connector.connect().await;
            if let Err(e) = &result {
                error!(exchange = %id, "Connect failed: {}", e);
                self.mark_down(id, e);
            } else {
                self.record_success(id);
            }
            results.insert(id.clone(), result);
        }
        results
    }

    pub async fn disconnect_all(&self) {
        for (id, connector) in &self.connectors {
            if let Err(e) = connector.disconnect().await {
                warn!(exchange = %id, "Disconnect failed: {}", e);
            }
        }
    }

    fn mark_down(&self, id: &str, failure: &ExchangeError) {
        if let Some(mut health) = self.health.get_mut(id) {
            health.status = HealthStatus::Down;
            health.last_error = Some(failure.to_string());
            health.updated_at = Utc::now();
        }
    }

    /// The connector for `id`, reconnecting first when it is down.
    pub async fn ensure_available(&self, id: &str) -> Result<Arc<dyn ExchangeConnector>, ExchangeError> {
        let connector = self.get(id)?;
        if self.is_available(id) {
            return Ok(connector);
        }
        info!(exchange = id, "Exchange down, attempting reconnect");
        match connector.connect().await {
            Ok(()) => {
                self.record_success(id);
                Ok(connector)
            }
            Err(e) => {
                self.mark_down(id, &e);
                Err(ExchangeError::NotConnected(format!("{}: {}", id, e)))
            }
        }
    }

    /// Route an order. A connector marked down is reconnected first and the
    /// order is refused with `NotConnected` if that fails.
    pub async fn place_order(&self, spec: &OrderSpec) -> Result<OrderAck, ExchangeError> {
        let connector = self.ensure_available(&spec.exchange).await?;
        let result = connector.place_order(spec).await;
        self.track(&spec.exchange, result)
    }

    pub async fn cancel_order(&self, exchange: &str, symbol: &str, exchange_order_id: &str) -> Result<(), ExchangeError> {
        let connector = self.ensure_available(exchange).await?;
        let result = connector.cancel_order(symbol, exchange_order_id).await;
        self.track(exchange, result)
    }

    pub async fn get_order_status(
        &self,
        exchange: &str,
        symbol: &str,
        order: OrderRef<'_>,
    ) -> Result<OrderAck, ExchangeError> {
        let connector = self.get(exchange)?;
        let result = connector.get_order_status(symbol, order).await;
        self.track(exchange, result)
    }

    pub async fn get_balances(&self, exchange: &str) -> Result<Vec<Balance>, ExchangeError> {
        let connector = self.get(exchange)?;
        let result = connector.get_balances().await;
        self.track(exchange, result)
    }

    pub async fn get_candles(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let connector = self.get(exchange)?;
        let result = connector.get_candles(symbol, timeframe, limit).await;
        self.track(exchange, result)
    }
}

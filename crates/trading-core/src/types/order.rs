//! Order types and the order lifecycle state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrderStateError;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Sign for position calculations (+1 for buy, -1 for sell).
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Order status.
///
/// `Pending -> Rejected | Open -> PartiallyFilled -> Filled`, and
/// `Open | PartiallyFilled -> Cancelled`. An exchange may report a fill
/// directly from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created locally, not yet acknowledged by the exchange
    Pending,
    /// Resting on the exchange
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Check if the order can still be filled.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    /// Staying in the same non-terminal state is allowed (e.g. a second
    /// partial fill).
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (Pending, _) => true,
            (Open, Open | PartiallyFilled | Filled | Cancelled) => true,
            (PartiallyFilled, PartiallyFilled | Filled | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Open => "OPEN",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// Request for a new order, as produced by the pipeline or an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Target exchange id
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Limit price (required for limit orders)
    pub price: Option<Decimal>,
    pub client_order_id: Option<String>,
    pub agent_id: Option<String>,
}

impl OrderSpec {
    /// Create a market order request.
    pub fn market(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            client_order_id: None,
            agent_id: None,
        }
    }

    /// Create a limit order request.
    pub fn limit(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(exchange, symbol, side, quantity)
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }

    /// Contract checks performed before any network call.
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("symbol is empty".into());
        }
        if self.exchange.trim().is_empty() {
            return Err("exchange is empty".into());
        }
        if self.quantity <= Decimal::ZERO {
            return Err(format!("quantity must be positive, got {}", self.quantity));
        }
        match (self.order_type, self.price) {
            (OrderType::Limit, None) => Err("limit order requires a price".into()),
            (_, Some(p)) if p <= Decimal::ZERO => {
                Err(format!("price must be positive, got {}", p))
            }
            _ => Ok(()),
        }
    }
}

/// Execution state reported by an exchange, via REST or user stream.
/// `executed_qty` is cumulative over the life of the order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    /// Average price over all executions so far
    pub avg_price: Option<Decimal>,
    pub reject_reason: Option<String>,
}

impl ExecutionReport {
    pub fn new(status: OrderStatus, executed_qty: Decimal, avg_price: Option<Decimal>) -> Self {
        Self {
            status,
            executed_qty,
            avg_price,
            reject_reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: OrderStatus::Rejected,
            executed_qty: Decimal::ZERO,
            avg_price: None,
            reject_reason: Some(reason.into()),
        }
    }
}

/// The incremental execution produced by applying a report to an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: Uuid,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// An order tracked by the order manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub client_order_id: String,
    pub account: String,
    pub agent_id: Option<String>,
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub status: OrderStatus,
    /// Cumulative executed quantity, never above `quantity`
    pub executed_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    /// Exchange-side order id (or transaction hash)
    pub tx_id: Option<String>,
    pub reject_reason: Option<String>,
    /// Submission outcome unknown after transient failures
    #[serde(default)]
    pub submission_uncertain: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a new pending order from a request.
    pub fn new(account: impl Into<String>, spec: &OrderSpec) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            client_order_id: spec
                .client_order_id
                .clone()
                .unwrap_or_else(|| id.simple().to_string()),
            account: account.into(),
            agent_id: spec.agent_id.clone(),
            exchange: spec.exchange.clone(),
            symbol: spec.symbol.clone(),
            side: spec.side,
            order_type: spec.order_type,
            price: spec.price,
            quantity: spec.quantity,
            status: OrderStatus::Pending,
            executed_qty: Decimal::ZERO,
            avg_fill_price: None,
            tx_id: None,
            reject_reason: None,
            submission_uncertain: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The request this order was created from.
    pub fn spec(&self) -> OrderSpec {
        OrderSpec {
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            order_type: self.order_type,
            quantity: self.quantity,
            price: self.price,
            client_order_id: Some(self.client_order_id.clone()),
            agent_id: self.agent_id.clone(),
        }
    }

    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.executed_qty
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Executed notional, if anything has been filled.
    pub fn filled_value(&self) -> Option<Decimal> {
        self.avg_fill_price.map(|price| price * self.executed_qty)
    }

    /// Mark the order rejected without any execution.
    pub fn reject(&mut self, reason: impl Into<String>) {
        self.status = OrderStatus::Rejected;
        self.reject_reason = Some(reason.into());
        self.submission_uncertain = false;
        self.updated_at = Utc::now();
    }

    /// Apply an exchange execution report.
    ///
    /// Only the positive delta between the reported cumulative quantity and
    /// the quantity already applied produces a [`Fill`], so a report seen
    /// twice (REST sync and user stream) changes nothing the second time.
    /// The fill price of the delta is derived from the change in average
    /// price.
    pub fn apply_report(&mut self, report: &ExecutionReport) -> Result<Option<Fill>, OrderStateError> {
        if self.status.is_terminal() {
            return Err(OrderStateError::Terminal(self.status));
        }

        let cumulative = report.executed_qty.min(self.quantity);
        let delta = cumulative - self.executed_qty;

        let mut next = report.status;
        if delta > Decimal::ZERO || cumulative > Decimal::ZERO {
            next = match next {
                OrderStatus::Pending | OrderStatus::Open if cumulative >= self.quantity => {
                    OrderStatus::Filled
                }
                OrderStatus::Pending | OrderStatus::Open => OrderStatus::PartiallyFilled,
                OrderStatus::PartiallyFilled if cumulative >= self.quantity => OrderStatus::Filled,
                other => other,
            };
        }
        // A stale report (e.g. OPEN arriving after PARTIALLY_FILLED) is a no-op
        if next == OrderStatus::Open && self.status == OrderStatus::PartiallyFilled {
            next = OrderStatus::PartiallyFilled;
        }
        if next != self.status && !self.status.can_transition_to(next) {
            return Err(OrderStateError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let fill = if delta > Decimal::ZERO {
            let price = self.delta_price(report.avg_price, cumulative, delta)?;
            self.avg_fill_price = report.avg_price.or(Some(price));
            self.executed_qty = cumulative;
            Some(Fill {
                order_id: self.id,
                side: self.side,
                quantity: delta,
                price,
                timestamp: Utc::now(),
            })
        } else {
            None
        };

        if next == OrderStatus::Rejected {
            self.reject_reason = report
                .reject_reason
                .clone()
                .or_else(|| Some("rejected by exchange".to_string()));
        }
        self.status = next;
        self.submission_uncertain = false;
        self.updated_at = Utc::now();
        Ok(fill)
    }

    fn delta_price(
        &self,
        avg_price: Option<Decimal>,
        cumulative: Decimal,
        delta: Decimal,
    ) -> Result<Decimal, OrderStateError> {
        let Some(avg) = avg_price else {
            return self.price.ok_or(OrderStateError::MissingFillPrice(delta));
        };
        let prior_value = self.avg_fill_price.unwrap_or(avg) * self.executed_qty;
        let price = (avg * cumulative - prior_value) / delta;
        Ok(if price > Decimal::ZERO { price } else { avg })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn spec() -> OrderSpec {
        OrderSpec::market("binance", "BTCUSDT", Side::Buy, dec!(2))
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec().validate().is_ok());
        assert!(OrderSpec::market("binance", "BTCUSDT", Side::Buy, dec!(0)).validate().is_err());
        assert!(OrderSpec::market("binance", "", Side::Buy, dec!(1)).validate().is_err());

        let mut limit = OrderSpec::limit("binance", "BTCUSDT", Side::Sell, dec!(1), dec!(100));
        assert!(limit.validate().is_ok());
        limit.price = None;
        assert!(limit.validate().is_err());
        limit.price = Some(dec!(-1));
        assert!(limit.validate().is_err());
    }

    #[test]
    fn test_new_order_is_pending() {
        let order = Order::new("acct-1", &spec().with_client_order_id("cid-1"));
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.client_order_id, "cid-1");
        assert_eq!(order.executed_qty, Decimal::ZERO);
        assert_eq!(order.spec().client_order_id.as_deref(), Some("cid-1"));
    }

    #[test]
    fn test_partial_then_full_fill() {
        let mut order = Order::new("acct-1", &spec());

        let fill = order
            .apply_report(&ExecutionReport::new(OrderStatus::PartiallyFilled, dec!(1), Some(dec!(100))))
            .unwrap()
            .unwrap();
        assert_eq!(fill.quantity, dec!(1));
        assert_eq!(fill.price, dec!(100));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);

        // Cumulative avg 102 over 2 units means the second unit filled at 104
        let fill = order
            .apply_report(&ExecutionReport::new(OrderStatus::Filled, dec!(2), Some(dec!(102))))
            .unwrap()
            .unwrap();
        assert_eq!(fill.quantity, dec!(1));
        assert_eq!(fill.price, dec!(104));
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(102)));
    }

    #[test]
    fn test_duplicate_report_applies_once() {
        let mut order = Order::new("acct-1", &spec());
        let report = ExecutionReport::new(OrderStatus::PartiallyFilled, dec!(1), Some(dec!(100)));

        assert!(order.apply_report(&report).unwrap().is_some());
        assert!(order.apply_report(&report).unwrap().is_none());
        assert_eq!(order.executed_qty, dec!(1));
    }

    #[test]
    fn test_executed_never_exceeds_quantity() {
        let mut order = Order::new("acct-1", &spec());
        let fill = order
            .apply_report(&ExecutionReport::new(OrderStatus::Filled, dec!(5), Some(dec!(10))))
            .unwrap()
            .unwrap();
        assert_eq!(fill.quantity, dec!(2));
        assert_eq!(order.executed_qty, order.quantity);
    }

    #[test]
    fn test_terminal_order_ignores_reports() {
        let mut order = Order::new("acct-1", &spec());
        order.reject("insufficient balance");
        let err = order
            .apply_report(&ExecutionReport::new(OrderStatus::Filled, dec!(2), Some(dec!(10))))
            .unwrap_err();
        assert_eq!(err, OrderStateError::Terminal(OrderStatus::Rejected));
    }

    #[test]
    fn test_missing_fill_price() {
        let mut order = Order::new("acct-1", &spec());
        let err = order
            .apply_report(&ExecutionReport::new(OrderStatus::Filled, dec!(2), None))
            .unwrap_err();
        assert_eq!(err, OrderStateError::MissingFillPrice(dec!(2)));
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[test]
    fn test_transitions() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Rejected));
        assert!(OrderStatus::Open.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Open.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::PartiallyFilled.can_transition_to(OrderStatus::Rejected));
        assert!(!OrderStatus::Filled.can_transition_to(OrderStatus::Cancelled));
    }
}

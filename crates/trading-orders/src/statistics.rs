//! Per-agent trading statistics.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use trading_core::types::{Order, OrderStatus, Position};

/// Summary of one agent's orders and positions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatistics {
    pub agent_id: String,
    pub total_orders: usize,
    /// Order count keyed by status name
    pub orders_by_status: BTreeMap<String, usize>,
    pub filled_orders: usize,
    pub rejected_orders: usize,
    pub active_orders: usize,
    /// Filled orders over orders that reached a terminal state
    pub fill_rate: f64,
    /// Executed notional across all orders
    pub traded_notional: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub open_positions: Vec<Position>,
}

impl AgentStatistics {
    pub fn from_orders<'a>(
        agent_id: &str,
        orders: impl IntoIterator<Item = &'a Order>,
        realized_pnl: Decimal,
        open_positions: Vec<Position>,
    ) -> Self {
        let mut stats = Self {
            agent_id: agent_id.to_string(),
            total_orders: 0,
            orders_by_status: BTreeMap::new(),
            filled_orders: 0,
            rejected_orders: 0,
            active_orders: 0,
            fill_rate: 0.0,
            traded_notional: Decimal::ZERO,
            realized_pnl,
            unrealized_pnl: open_positions.iter().map(|p| p.unrealized_pnl).sum(),
            open_positions,
        };

        let mut terminal = 0usize;
        for order in orders {
            stats.total_orders += 1;
            *stats.orders_by_status.entry(order.status.to_string()).or_insert(0) += 1;
            match order.status {
                OrderStatus::Filled => stats.filled_orders += 1,
                OrderStatus::Rejected => stats.rejected_orders += 1,
                status if status.is_active() => stats.active_orders += 1,
                _ => {}
            }
            if order.is_terminal() {
                terminal += 1;
            }
            stats.traded_notional += order.filled_value().unwrap_or(Decimal::ZERO);
        }
        if terminal > 0 {
            stats.fill_rate = stats.filled_orders as f64 / terminal as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use trading_core::types::{ExecutionReport, OrderSpec, Side};

    fn order(status: OrderStatus, executed: Decimal, price: Option<Decimal>) -> Order {
        let spec = OrderSpec::market("binance", "BTCUSDT", Side::Buy, dec!(1)).with_agent("agent-1");
        let mut order = Order::new("acct", &spec);
        match status {
            OrderStatus::Rejected => order.reject("no funds"),
            OrderStatus::Pending => {}
            _ => {
                order.apply_report(&ExecutionReport::new(status, executed, price)).unwrap();
            }
        }
        order
    }

    #[test]
    fn test_counts_and_fill_rate() {
        let orders = vec![
            order(OrderStatus::Filled, dec!(1), Some(dec!(100))),
            order(OrderStatus::Filled, dec!(1), Some(dec!(110))),
            order(OrderStatus::Rejected, dec!(0), None),
            order(OrderStatus::Open, dec!(0), None),
            order(OrderStatus::Pending, dec!(0), None),
        ];
        let stats = AgentStatistics::from_orders("agent-1", &orders, dec!(12.5), Vec::new());

        assert_eq!(stats.total_orders, 5);
        assert_eq!(stats.filled_orders, 2);
        assert_eq!(stats.rejected_orders, 1);
        assert_eq!(stats.active_orders, 2);
        assert_eq!(stats.orders_by_status["FILLED"], 2);
        assert!((stats.fill_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.traded_notional, dec!(210));
        assert_eq!(stats.realized_pnl, dec!(12.5));
    }

    #[test]
    fn test_empty_agent() {
        let stats = AgentStatistics::from_orders("nobody", std::iter::empty(), Decimal::ZERO, Vec::new());
        assert_eq!(stats.total_orders, 0);
        assert_eq!(stats.fill_rate, 0.0);
    }
}

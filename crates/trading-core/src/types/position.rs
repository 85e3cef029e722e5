//! Positions and the per-account position book.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{Fill, Side};

/// Net holding of one symbol in one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub account: String,
    pub agent_id: Option<String>,
    pub symbol: String,
    /// Signed quantity (positive long, negative short)
    pub quantity: Decimal,
    /// Average entry price of the open quantity
    pub avg_price: Decimal,
    /// Last mark price applied
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    /// Realized P&L accumulated while this row was open
    pub realized_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn new(account: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            agent_id: None,
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            mark_price: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.quantity < Decimal::ZERO
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Notional at the last mark price.
    pub fn notional(&self) -> Decimal {
        self.quantity.abs() * self.mark_price
    }

    /// Re-mark the position and recompute unrealized P&L.
    pub fn update_mark(&mut self, price: Decimal) {
        self.mark_price = price;
        self.unrealized_pnl = if self.is_flat() {
            Decimal::ZERO
        } else {
            (price - self.avg_price) * self.quantity
        };
    }

    /// Apply a signed fill. Returns the P&L realized by any reduction.
    ///
    /// Adding in the same direction moves the average to the weighted
    /// average; reducing keeps the average; crossing through zero opens the
    /// remainder at the fill price.
    pub fn apply_fill(&mut self, side: Side, quantity: Decimal, price: Decimal) -> Decimal {
        let fill_qty = side.sign() * quantity;
        let mut realized = Decimal::ZERO;

        let same_direction = (self.quantity > Decimal::ZERO && fill_qty > Decimal::ZERO)
            || (self.quantity < Decimal::ZERO && fill_qty < Decimal::ZERO);

        if same_direction || self.is_flat() {
            let new_quantity = self.quantity + fill_qty;
            if !new_quantity.is_zero() {
                self.avg_price =
                    (self.quantity * self.avg_price + fill_qty * price) / new_quantity;
            }
            self.quantity = new_quantity;
        } else {
            let closed = fill_qty.abs().min(self.quantity.abs());
            realized = if self.is_long() {
                closed * (price - self.avg_price)
            } else {
                closed * (self.avg_price - price)
            };
            self.realized_pnl += realized;

            let remainder = fill_qty.abs() - closed;
            if remainder > Decimal::ZERO {
                self.quantity = side.sign() * remainder;
                self.avg_price = price;
            } else {
                self.quantity += fill_qty;
            }
        }

        if self.is_flat() {
            self.avg_price = Decimal::ZERO;
        }
        self.update_mark(price);
        self.updated_at = Utc::now();
        realized
    }
}

/// Outcome of applying one fill to the book.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionChange {
    pub account: String,
    pub symbol: String,
    pub previous_quantity: Decimal,
    /// The row after the fill, `None` once the position is flat
    pub position: Option<Position>,
    pub realized: Decimal,
}

#[derive(Debug, Default)]
struct BookState {
    positions: HashMap<(String, String), Position>,
    daily_realized: HashMap<(String, NaiveDate), Decimal>,
}

/// Thread-safe map of (account, symbol) to position.
///
/// Flat positions are removed. Realized P&L is also accumulated per account
/// and UTC day for the daily-loss circuit breaker.
#[derive(Debug, Default)]
pub struct PositionBook {
    state: Mutex<BookState>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BookState> {
        // A poisoned book still holds consistent rows: every mutation
        // completes before the guard drops.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply an execution to the (account, symbol) row.
    pub fn apply_fill(
        &self,
        account: &str,
        agent_id: Option<&str>,
        symbol: &str,
        fill: &Fill,
    ) -> PositionChange {
        let mut state = self.lock();
        let key = (account.to_string(), symbol.to_string());

        let position = state
            .positions
            .entry(key.clone())
            .or_insert_with(|| Position::new(account, symbol));
        if position.agent_id.is_none() {
            position.agent_id = agent_id.map(str::to_string);
        }

        let previous_quantity = position.quantity;
        let realized = position.apply_fill(fill.side, fill.quantity, fill.price);
        let snapshot = if position.is_flat() {
            None
        } else {
            Some(position.clone())
        };
        if snapshot.is_none() {
            state.positions.remove(&key);
        }

        if !realized.is_zero() {
            let day = fill.timestamp.date_naive();
            *state
                .daily_realized
                .entry((account.to_string(), day))
                .or_insert(Decimal::ZERO) += realized;
        }

        PositionChange {
            account: account.to_string(),
            symbol: symbol.to_string(),
            previous_quantity,
            position: snapshot,
            realized,
        }
    }

    pub fn get(&self, account: &str, symbol: &str) -> Option<Position> {
        self.lock()
            .positions
            .get(&(account.to_string(), symbol.to_string()))
            .cloned()
    }

    /// Signed quantity held, zero when there is no row.
    pub fn net_quantity(&self, account: &str, symbol: &str) -> Decimal {
        self.get(account, symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn positions_for(&self, account: &str) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .lock()
            .positions
            .values()
            .filter(|p| p.account == account)
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    pub fn all(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.lock().positions.values().cloned().collect();
        positions.sort_by(|a, b| (&a.account, &a.symbol).cmp(&(&b.account, &b.symbol)));
        positions
    }

    /// Re-mark every row for `symbol`.
    pub fn update_mark(&self, symbol: &str, price: Decimal) {
        let mut state = self.lock();
        for position in state.positions.values_mut().filter(|p| p.symbol == symbol) {
            position.update_mark(price);
        }
    }

    /// Realized P&L booked for `account` on UTC `day`.
    pub fn realized_pnl(&self, account: &str, day: NaiveDate) -> Decimal {
        self.lock()
            .daily_realized
            .get(&(account.to_string(), day))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn len(&self) -> usize {
        self.lock().positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

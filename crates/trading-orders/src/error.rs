use thiserror::Error;
use trading_core::error::{ExchangeError, OrderStateError};
use trading_core::types::OrderStatus;
use uuid::Uuid;

/// Errors returned by the order manager.
///
/// Rejections carry the id of the recorded order so the caller can still
/// query it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("Invalid order: {0}")]
    Validation(String),

    #[error("Order {order_id} blocked by risk: {reason}")]
    RiskRejected { order_id: Uuid, reason: String },

    #[error("Order {order_id} rejected by exchange: {reason}")]
    ExchangeRejected { order_id: Uuid, reason: String },

    #[error("Order not found: {0}")]
    NotFound(Uuid),

    #[error("Order {order_id} is {status}")]
    InvalidState { order_id: Uuid, status: OrderStatus },

    #[error("Order {0} has not been acknowledged by the exchange")]
    NotSubmitted(Uuid),

    #[error("Order manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    State(#[from] OrderStateError),
}

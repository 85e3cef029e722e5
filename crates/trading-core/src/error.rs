//! Error types for the trading system.

use thiserror::Error;

use crate::types::OrderStatus;

/// Strategy-specific errors.
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Insufficient data: need {required} bars, have {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("No candle history for {symbol}/{timeframe}")]
    NoHistory { symbol: String, timeframe: String },

    #[error("Strategy not found: {0}")]
    NotFound(String),

    #[error("Malformed signal: {0}")]
    MalformedSignal(String),

    #[error("Strategy error: {0}")]
    Internal(String),
}

/// Errors raised by exchange connectors.
///
/// The variants split into three families: transient I/O that is retried,
/// fatal configuration/authentication problems, and terminal order rejects.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Rate limited: retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Order rejected: {reason}")]
    Rejected { code: Option<i64>, reason: String },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Connector {0} is not connected")]
    NotConnected(String),

    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),
}

impl ExchangeError {
    /// Whether the failure may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Network(_)
            | ExchangeError::Timeout(_)
            | ExchangeError::RateLimited { .. }
            | ExchangeError::WebSocket(_) => true,
            ExchangeError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the failure must stop the caller immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExchangeError::Authentication(_) | ExchangeError::Configuration(_)
        )
    }

    /// Whether the exchange refused the order itself.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ExchangeError::Rejected { .. })
    }
}

/// Data source and data-service errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("No price available for {0}")]
    PriceUnavailable(String),

    #[error("No data available for the requested range")]
    NoDataAvailable,

    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Data source error: {0}")]
    Internal(String),
}

/// Indicator calculation errors.
#[derive(Error, Debug)]
pub enum IndicatorError {
    #[error("Insufficient data: need {required} points, have {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Errors raised when an execution report cannot be applied to an order.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderStateError {
    #[error("Order is already {0}")]
    Terminal(OrderStatus),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Execution of {0} reported without a fill price")]
    MissingFillPrice(rust_decimal::Decimal),
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Network("reset".into()).is_transient());
        assert!(ExchangeError::Timeout(5000).is_transient());
        assert!(ExchangeError::Api { status: 503, message: "busy".into() }.is_transient());
        assert!(!ExchangeError::Api { status: 400, message: "bad".into() }.is_transient());
        assert!(!ExchangeError::Authentication("bad key".into()).is_transient());
        assert!(!ExchangeError::Rejected { code: Some(-2010), reason: "balance".into() }.is_transient());
    }

    #[test]
    fn test_fatal_and_rejection() {
        assert!(ExchangeError::Authentication("bad key".into()).is_fatal());
        assert!(!ExchangeError::Network("reset".into()).is_fatal());
        assert!(ExchangeError::Rejected { code: None, reason: "x".into() }.is_rejection());
    }
}

//! Exchange integrations.
//!
//! Every venue implements [`trading_core::traits::ExchangeConnector`];
//! [`ExchangeManager`] owns the configured connectors and tracks their health.

pub mod binance;
pub mod manager;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod signing;
pub mod simulated;
pub mod ws;

pub use binance::{BinanceConfig, BinanceConnector};
pub use manager::{ConnectorHealth, ExchangeManager, HealthStatus};
pub use rate_limiter::{RateLimitRule, RateLimiter};
pub use registry::{ExchangeConfig, ExchangeKind};
pub use retry::RetryPolicy;
pub use signing::{Credentials, HmacSigner, RequestSigner};
pub use simulated::{SimulatedConfig, SimulatedConnector, SimulatedExchangeState, SimulatedOrder};
pub use ws::{StreamConfig, StreamHandler, StreamSupervisor};

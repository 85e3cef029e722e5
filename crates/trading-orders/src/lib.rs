//! Order lifecycle management.
//!
//! [`OrderManager`] takes order requests through the risk gate to the
//! exchanges, folds execution reports from REST and user streams into
//! orders and positions, and resolves submissions whose outcome is unknown.

mod error;
mod manager;
mod statistics;

pub use error::OrderError;
pub use manager::{OrderFilter, OrderManager, OrderManagerConfig};
pub use statistics::AgentStatistics;

//! Alert delivery.

use crate::types::Alert;
use async_trait::async_trait;

/// Destination for operator alerts. Delivery is best effort.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, alert: Alert);
}

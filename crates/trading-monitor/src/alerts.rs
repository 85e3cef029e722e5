//! Alert sinks.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use trading_core::traits::AlertSink;
use trading_core::types::{Alert, AlertSeverity};

/// Writes alerts to the log at a level matching their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send_alert(&self, alert: Alert) {
        let account = alert.account.as_deref().unwrap_or("-");
        match alert.severity {
            AlertSeverity::Info => info!(source = %alert.source, account, "ALERT {}", alert.message),
            AlertSeverity::Warning => warn!(source = %alert.source, account, "ALERT {}", alert.message),
            AlertSeverity::Critical => error!(source = %alert.source, account, "ALERT {}", alert.message),
        }
    }
}

/// Forwards alerts into a bounded channel. Alerts are dropped, with a
/// warning, when the receiver lags or is gone.
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::Sender<Alert>,
}

impl ChannelAlertSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertSink for ChannelAlertSink {
    async fn send_alert(&self, alert: Alert) {
        if let Err(e) = self.tx.try_send(alert) {
            warn!("Alert dropped: {}", e);
        }
    }
}

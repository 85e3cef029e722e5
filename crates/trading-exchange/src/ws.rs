//! Supervised WebSocket streams.
//!
//! A [`StreamSupervisor`] owns one socket: it connects, forwards text frames
//! to a [`StreamHandler`], pings on a heartbeat, and reconnects after an
//! unexpected close. After `max_reconnect_attempts` consecutive failures it
//! reports [`StreamStatus::StreamFailed`] and exits so the caller can fall
//! back to polling.

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use trading_core::error::ExchangeError;
use trading_core::types::{StreamStatus, StreamStatusEvent};

/// Heartbeat and reconnect settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            reconnect_delay_ms: 1_000,
            max_reconnect_attempts: 10,
            connect_timeout_ms: 10_000,
        }
    }
}

impl StreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Silence longer than this means the connection is dead.
    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat_interval() * 2
    }
}

/// Consumer of a stream's text frames.
#[async_trait]
pub trait StreamHandler: Send + 'static {
    /// Handle one frame. Returns false once the consumer has gone away,
    /// which ends the stream.
    async fn handle(&mut self, text: &str) -> bool;
}

enum StreamExit {
    Shutdown,
    ConsumerGone,
    /// Closed by the server or found dead; reconnect
    Dropped,
}

/// Keeps one stream alive until shutdown or until reconnects are exhausted.
pub struct StreamSupervisor {
    exchange: String,
    name: String,
    url: String,
    config: StreamConfig,
    status: mpsc::Sender<StreamStatusEvent>,
}

impl StreamSupervisor {
    pub fn new(
        exchange: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        config: StreamConfig,
        status: mpsc::Sender<StreamStatusEvent>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            name: name.into(),
            url: url.into(),
            config,
            status,
        }
    }

    fn report(&self, status: StreamStatus) {
        let event = StreamStatusEvent {
            exchange: self.exchange.clone(),
            stream: self.name.clone(),
            status,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.status.try_send(event) {
            debug!(stream = %self.name, "Stream status not delivered: {}", e);
        }
    }

    /// Fixed wait between a lost connection and the next attempt.
    fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.config.reconnect_delay_ms)
    }

    /// Run until shutdown, consumer loss, or reconnect exhaustion.
    pub async fn run<H: StreamHandler>(self, mut handler: H, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;
        info!(exchange = %self.exchange, stream = %self.name, "Starting stream");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.connect_and_stream(&mut handler, &mut shutdown, &mut failures).await {
                Ok(StreamExit::Shutdown) => break,
                Ok(StreamExit::ConsumerGone) => {
                    info!(stream = %self.name, "Stream consumer gone, stopping");
                    break;
                }
                Ok(StreamExit::Dropped) => {
                    warn!(stream = %self.name, "Stream dropped");
                }
                Err(e) => {
                    error!(stream = %self.name, attempt = failures + 1, "Stream error: {}", e);
                }
            }

            failures += 1;
            if failures > self.config.max_reconnect_attempts {
                error!(
                    stream = %self.name,
                    attempts = self.config.max_reconnect_attempts,
                    "Giving up on stream"
                );
                self.report(StreamStatus::StreamFailed {
                    reason: format!(
                        "{} reconnect attempts exhausted",
                        self.config.max_reconnect_attempts
                    ),
                });
                return;
            }

            let delay = self.reconnect_delay();
            info!(stream = %self.name, attempt = failures, delay_ms = delay.as_millis() as u64, "Reconnecting");
            self.report(StreamStatus::Reconnecting { attempt: failures });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.report(StreamStatus::Closed);
        info!(stream = %self.name, "Stream stopped");
    }

    async fn connect_and_stream<H: StreamHandler>(
        &self,
        handler: &mut H,
        shutdown: &mut watch::Receiver<bool>,
        failures: &mut u32,
    ) -> Result<StreamExit, ExchangeError> {
        debug!(url = %self.url, "Connecting WebSocket");
        let (ws_stream, _) = tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| ExchangeError::Timeout(self.config.connect_timeout_ms))?
        .map_err(|e| ExchangeError::WebSocket(e.to_string()))?;

        *failures = 0;
        self.report(StreamStatus::Connected);
        info!(stream = %self.name, "Stream connected");

        let (mut write, mut read) = ws_stream.split();
        let mut heartbeat = interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                msg = read.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !handler.handle(&text).await {
                                let _ = write.send(Message::Close(None)).await;
                                return Ok(StreamExit::ConsumerGone);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                return Err(ExchangeError::WebSocket(e.to_string()));
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(stream = %self.name, ?frame, "Close frame received");
                            return Ok(StreamExit::Dropped);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(ExchangeError::WebSocket(e.to_string())),
                        None => return Ok(StreamExit::Dropped),
                    }
                }
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.config.idle_timeout() {
                        warn!(stream = %self.name, "No traffic within heartbeat timeout");
                        return Ok(StreamExit::Dropped);
                    }
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        return Err(ExchangeError::WebSocket(e.to_string()));
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender also means stop
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(StreamExit::Shutdown);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct Collect(mpsc::Sender<String>);

    #[async_trait]
    impl StreamHandler for Collect {
        async fn handle(&mut self, text: &str) -> bool {
            self.0.send(text.to_string()).await.is_ok()
        }
    }

    fn fast_config(max_reconnect_attempts: u32) -> StreamConfig {
        StreamConfig {
            heartbeat_interval_ms: 1_000,
            reconnect_delay_ms: 10,
            max_reconnect_attempts,
            connect_timeout_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_stream_failed_after_max_attempts() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (status_tx, mut status_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (sink, _rx) = mpsc::channel(16);
        let supervisor = StreamSupervisor::new("test", "dead", format!("ws://{}", addr), fast_config(2), status_tx);

        supervisor.run(Collect(sink), shutdown_rx).await;

        let mut statuses = Vec::new();
        while let Ok(event) = status_rx.try_recv() {
            statuses.push(event.status);
        }
        assert_eq!(
            statuses,
            vec![
                StreamStatus::Reconnecting { attempt: 1 },
                StreamStatus::Reconnecting { attempt: 2 },
                StreamStatus::StreamFailed { reason: "2 reconnect attempts exhausted".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_forwards_frames_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Each connection gets one frame and is then closed by the server
        tokio::spawn(async move {
            for n in 0..2 {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                ws.send(Message::Text(format!("frame-{}", n))).await.unwrap();
                ws.close(None).await.ok();
            }
        });

        let (status_tx, mut status_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (sink, mut frames) = mpsc::channel(16);
        let supervisor = StreamSupervisor::new("test", "echo", format!("ws://{}", addr), fast_config(5), status_tx);
        let task = tokio::spawn(supervisor.run(Collect(sink), shutdown_rx));

        assert_eq!(frames.recv().await.unwrap(), "frame-0");
        assert_eq!(frames.recv().await.unwrap(), "frame-1");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let mut connects = 0;
        while let Ok(event) = status_rx.try_recv() {
            if event.status == StreamStatus::Connected {
                connects += 1;
            }
            assert_eq!(event.stream, "echo");
        }
        assert_eq!(connects, 2);
    }

    #[test]
    fn test_reconnect_delay_is_fixed() {
        let (status_tx, _rx) = mpsc::channel(1);
        let supervisor = StreamSupervisor::new(
            "test",
            "s",
            "ws://localhost",
            StreamConfig {
                reconnect_delay_ms: 1_000,
                ..StreamConfig::default()
            },
            status_tx,
        );
        for _ in 0..5 {
            assert_eq!(supervisor.reconnect_delay(), Duration::from_millis(1_000));
        }
    }
}

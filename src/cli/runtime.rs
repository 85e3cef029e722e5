//! Wiring of connectors, risk, orders and the pipeline from configuration.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use trading_config::AppConfig;
use trading_core::error::DataError;
use tokio::sync::mpsc;
use trading_core::traits::{AlertSink, ExchangeConnector, MarketDataSource, SignalGenerator, SubscriptionHandle};
use trading_core::types::{Bar, MarketChannel, PositionBook, Timeframe};
use trading_data::{ConnectorDataSource, ConnectorTradingData, CsvDataSource, PriceCache};
use trading_exchange::{ExchangeKind, ExchangeManager, SimulatedConnector};
use trading_monitor::LogAlertSink;
use trading_orders::OrderManager;
use trading_risk::RiskManager;
use trading_strategies::SignalAggregator;
use trading_workflow::TradingPipeline;

/// How orders are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Orders go to the configured connectors
    Live,
    /// Every exchange is replaced by a simulated one fed with market prices
    Paper,
}

/// Everything a command needs, built once.
pub struct Runtime {
    pub config: AppConfig,
    pub exchanges: Arc<ExchangeManager>,
    pub orders: Arc<OrderManager>,
    pub pipeline: TradingPipeline,
    /// Live price source; `None` when candles come from files
    stream_source: Option<Arc<dyn ExchangeConnector>>,
    prices: Arc<PriceCache>,
    books: Vec<Arc<SimulatedConnector>>,
}

const PRICE_EVENT_CAPACITY: usize = 1024;

/// Candles from `inner`; each fetch also moves the simulated books to the
/// latest close so market orders fill at market prices.
struct PaperFeed {
    inner: Arc<dyn MarketDataSource>,
    books: Vec<Arc<SimulatedConnector>>,
}

#[async_trait]
impl MarketDataSource for PaperFeed {
    async fn get_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Bar>, DataError> {
        let bars = self.inner.get_candles(symbol, timeframe, limit).await?;
        if let Some(close) = bars.last().and_then(|bar| Decimal::try_from(bar.close).ok()) {
            for book in &self.books {
                book.set_price(symbol, close).await;
            }
        }
        Ok(bars)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

impl Runtime {
    pub fn build(config: AppConfig, mode: Mode, data_dir: Option<&Path>) -> Result<Self> {
        config.validate()?;

        let mut exchanges = ExchangeManager::new();
        let mut books = Vec::new();
        let mut market: Option<Arc<dyn ExchangeConnector>> = None;
        for entry in config.enabled_exchanges() {
            let connector: Arc<dyn ExchangeConnector> = match mode {
                Mode::Paper => {
                    if entry.kind != ExchangeKind::Simulated && market.is_none() {
                        market = Some(entry.build().with_context(|| format!("building {} market data", entry.id))?);
                    }
                    let book = Arc::new(entry.build_simulated());
                    books.push(book.clone());
                    book
                }
                Mode::Live => entry.build().with_context(|| format!("building exchange {}", entry.id))?,
            };
            exchanges
                .register(connector.clone())
                .with_context(|| format!("registering exchange {}", entry.id))?;
            if mode == Mode::Live && market.is_none() {
                market = Some(connector);
            }
        }
        let exchanges = Arc::new(exchanges);

        let candles: Arc<dyn MarketDataSource> = match (data_dir, &market) {
            (Some(dir), _) => Arc::new(
                CsvDataSource::new(dir).with_context(|| format!("opening candle directory {}", dir.display()))?,
            ),
            (None, Some(connector)) => Arc::new(ConnectorDataSource::new(connector.clone())),
            (None, None) => bail!("no market data: configure a non-simulated exchange or pass --data"),
        };
        let stream_source = if data_dir.is_none() { market.clone() } else { None };
        let candles: Arc<dyn MarketDataSource> = if books.is_empty() {
            candles
        } else {
            Arc::new(PaperFeed {
                inner: candles,
                books: books.clone(),
            })
        };

        let primary = match config.pipeline.exchanges.first() {
            Some(id) => exchanges.get(id)?,
            None => {
                let id = exchanges.ids().into_iter().next().context("no exchange registered")?;
                exchanges.get(&id)?
            }
        };

        let alerts: Arc<dyn AlertSink> = Arc::new(LogAlertSink);
        let positions = Arc::new(PositionBook::new());
        let prices = Arc::new(PriceCache::new());
        let account_data = Arc::new(ConnectorTradingData::new(primary, prices.clone(), positions.clone()));
        let risk = Arc::new(
            RiskManager::new(config.risk.clone(), account_data, positions.clone()).with_alerts(alerts.clone()),
        );
        let orders = Arc::new(
            OrderManager::new(config.orders.clone(), exchanges.clone(), risk.clone(), positions)
                .with_alerts(alerts),
        );

        let strategies = config
            .strategy_kinds()
            .into_iter()
            .map(|kind| {
                let name = kind.name();
                kind.build().with_context(|| format!("building strategy {}", name))
            })
            .collect::<Result<Vec<Box<dyn SignalGenerator>>>>()?;
        info!(
            strategies = strategies.len(),
            exchanges = exchanges.len(),
            mode = ?mode,
            "Runtime assembled"
        );

        let pipeline = TradingPipeline::new(
            config.pipeline.clone(),
            candles,
            strategies,
            SignalAggregator::new(config.aggregation.clone()),
            risk,
            orders.clone(),
        )
        .with_price_cache(prices.clone());

        Ok(Self {
            config,
            exchanges,
            orders,
            pipeline,
            stream_source,
            prices,
            books,
        })
    }

    /// Connect every exchange; failures leave the exchange marked down.
    pub async fn connect(&self) -> Result<()> {
        let results = self.exchanges.connect_all().await;
        let connected = results.values().filter(|r| r.is_ok()).count();
        for (id, result) in &results {
            if let Err(e) = result {
                warn!(exchange = %id, "Connection failed: {}", e);
            }
        }
        if connected == 0 {
            bail!("no exchange could be connected");
        }
        Ok(())
    }

    /// Subscribe to tickers for the pipeline symbols. Each price updates the
    /// price cache and, in paper mode, the simulated books so resting limit
    /// orders fill between runs. `None` when there is no live source.
    pub async fn stream_prices(&self) -> Result<Option<SubscriptionHandle>> {
        let Some(source) = &self.stream_source else {
            return Ok(None);
        };
        let (tx, mut rx) = mpsc::channel(PRICE_EVENT_CAPACITY);
        let mut handle = source
            .subscribe_market_data(&self.config.pipeline.symbols, &[MarketChannel::Ticker], tx)
            .await
            .with_context(|| format!("subscribing to {} market data", source.id()))?;

        let prices = self.prices.clone();
        let books = self.books.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                prices.apply(&event);
                if let Some(price) = event.last_price() {
                    for book in &books {
                        book.set_price(event.symbol(), price).await;
                    }
                }
            }
            debug!("Price stream closed");
        });

        if let Some(mut status) = handle.take_status_receiver() {
            let exchanges = self.exchanges.clone();
            tokio::spawn(async move {
                while let Some(event) = status.recv().await {
                    exchanges.record_stream_status(&event);
                }
            });
        }
        info!(
            exchange = %source.id(),
            streams = handle.stream_count(),
            "Streaming prices"
        );
        Ok(Some(handle))
    }

    pub async fn shutdown(&self) {
        self.orders.shutdown().await;
        self.exchanges.disconnect_all().await;
    }
}

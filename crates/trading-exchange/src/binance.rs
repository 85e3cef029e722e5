//! Binance spot connector: signed REST calls and supervised streams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use trading_core::error::ExchangeError;
use trading_core::traits::{ExchangeConnector, OrderAck, OrderRef, SubscriptionHandle};
use trading_core::types::{
    Balance, Bar, ExecutionReport, MarketChannel, MarketEvent, OrderEvent, OrderSpec, OrderStatus,
    OrderType, PositionEvent, Timeframe,
};
use uuid::Uuid;

use crate::rate_limiter::{RateLimitRule, RateLimiter};
use crate::retry::RetryPolicy;
use crate::signing::{Credentials, HmacSigner, RequestSigner};
use crate::ws::{StreamConfig, StreamHandler, StreamSupervisor};

const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const ORDER_KEY: &str = "order";
const ACCOUNT_KEY: &str = "account";
const MARKET_KEY: &str = "market";
const STATUS_CAPACITY: usize = 256;
const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(30 * 60);

/// Binance connection settings.
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub id: String,
    pub rest_url: String,
    pub ws_url: String,
    pub credentials: Option<Credentials>,
    pub recv_window_ms: u64,
    /// Per-call timeout
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub stream: StreamConfig,
    pub rate_limits: Vec<RateLimitRule>,
}

impl BinanceConfig {
    pub fn new(rest_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            id: "binance".to_string(),
            rest_url: rest_url.into(),
            ws_url: ws_url.into(),
            credentials: None,
            recv_window_ms: 5_000,
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            stream: StreamConfig::default(),
            rate_limits: Self::default_rate_limits(),
        }
    }

    /// Production endpoints with keys from `BINANCE_API_KEY` and
    /// `BINANCE_API_SECRET`.
    pub fn from_env() -> Result<Self, ExchangeError> {
        let rest_url = std::env::var("BINANCE_REST_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());
        let ws_url = std::env::var("BINANCE_WS_URL")
            .unwrap_or_else(|_| "wss://stream.binance.com:9443".to_string());
        let credentials = Credentials::from_env("BINANCE_API_KEY", "BINANCE_API_SECRET")?;
        Ok(Self::new(rest_url, ws_url).with_credentials(credentials))
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// 1200 calls per minute overall, 10 orders per second.
    pub fn default_rate_limits() -> Vec<RateLimitRule> {
        vec![
            RateLimitRule::new(1200, Duration::from_secs(60)),
            RateLimitRule::new(10, Duration::from_secs(1)).for_key(ORDER_KEY),
        ]
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceOrder {
    #[allow(dead_code)]
    symbol: String,
    order_id: i64,
    client_order_id: String,
    executed_qty: String,
    #[serde(rename = "cummulativeQuoteQty")]
    cumulative_quote_qty: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct BinanceAccount {
    balances: Vec<BinanceBalance>,
}

#[derive(Debug, Deserialize)]
struct BinanceBalance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKey {
    listen_key: String,
}

/// Stream payloads, tagged by the `e` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum StreamMessage {
    #[serde(rename = "trade")]
    Trade {
        #[serde(rename = "s")]
        symbol: String,
        #[serde(rename = "p")]
        price: String,
        #[serde(rename = "q")]
        quantity: String,
        #[serde(rename = "T")]
        trade_time: i64,
    },
    #[serde(rename = "24hrTicker")]
    Ticker {
        #[serde(rename = "E")]
        event_time: i64,
        #[serde(rename = "s")]
        symbol: String,
        #[serde(rename = "b")]
        bid: String,
        #[serde(rename = "a")]
        ask: String,
        #[serde(rename = "c")]
        last: String,
    },
    #[serde(rename = "kline")]
    Kline {
        #[serde(rename = "s")]
        symbol: String,
        #[serde(rename = "k")]
        kline: StreamKline,
    },
    #[serde(rename = "executionReport")]
    ExecutionReport {
        #[serde(rename = "s")]
        symbol: String,
        #[serde(rename = "c")]
        client_order_id: String,
        /// Original client id, set on cancels
        #[serde(rename = "C", default)]
        orig_client_order_id: String,
        #[serde(rename = "X")]
        status: String,
        #[serde(rename = "r", default)]
        reject_reason: String,
        #[serde(rename = "i")]
        order_id: i64,
        #[serde(rename = "z")]
        cumulative_qty: String,
        #[serde(rename = "Z")]
        cumulative_quote_qty: String,
        #[serde(rename = "T")]
        transaction_time: i64,
    },
    #[serde(rename = "outboundAccountPosition")]
    AccountPosition {
        #[serde(rename = "E")]
        event_time: i64,
        #[serde(rename = "B")]
        balances: Vec<StreamBalance>,
    },
}

#[derive(Debug, Deserialize)]
struct StreamKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct StreamBalance {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "f")]
    free: String,
    #[serde(rename = "l")]
    locked: String,
}

fn decimal(value: &str) -> Result<Decimal, ExchangeError> {
    value
        .parse()
        .map_err(|_| ExchangeError::Decode(format!("invalid decimal: {}", value)))
}

fn float(value: &str) -> Result<f64, ExchangeError> {
    value
        .parse()
        .map_err(|_| ExchangeError::Decode(format!("invalid number: {}", value)))
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn map_status(status: &str) -> Result<OrderStatus, ExchangeError> {
    match status {
        "PENDING_NEW" => Ok(OrderStatus::Pending),
        "NEW" | "PENDING_CANCEL" => Ok(OrderStatus::Open),
        "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
        "FILLED" => Ok(OrderStatus::Filled),
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => Ok(OrderStatus::Cancelled),
        "REJECTED" => Ok(OrderStatus::Rejected),
        other => Err(ExchangeError::Decode(format!("unknown order status: {}", other))),
    }
}

fn execution_report(
    status: &str,
    executed_qty: &str,
    quote_qty: &str,
    reject_reason: Option<&str>,
) -> Result<ExecutionReport, ExchangeError> {
    let executed = decimal(executed_qty)?;
    let quote = decimal(quote_qty)?;
    let avg_price = (executed > Decimal::ZERO).then(|| quote / executed);
    let mut report = ExecutionReport::new(map_status(status)?, executed, avg_price);
    if report.status == OrderStatus::Rejected {
        report.reject_reason = Some(
            reject_reason
                .filter(|r| !r.is_empty() && *r != "NONE")
                .unwrap_or("rejected by exchange")
                .to_string(),
        );
    }
    Ok(report)
}

impl BinanceOrder {
    fn into_ack(self) -> Result<OrderAck, ExchangeError> {
        let report = execution_report(&self.status, &self.executed_qty, &self.cumulative_quote_qty, None)?;
        Ok(OrderAck {
            exchange_order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id,
            report,
        })
    }
}

fn classify(status: StatusCode, retry_after_secs: Option<u64>, body: &str) -> ExchangeError {
    match status.as_u16() {
        429 | 418 => ExchangeError::RateLimited {
            retry_after_ms: retry_after_secs.unwrap_or(1) * 1000,
        },
        401 | 403 => ExchangeError::Authentication(body.to_string()),
        s if s >= 500 => ExchangeError::Api {
            status: s,
            message: body.to_string(),
        },
        s => match serde_json::from_str::<ApiErrorBody>(body) {
            Ok(err) => match err.code {
                -2013 => ExchangeError::OrderNotFound(err.msg),
                -2014 | -2015 | -1022 => ExchangeError::Authentication(err.msg),
                -1003 => ExchangeError::RateLimited {
                    retry_after_ms: retry_after_secs.unwrap_or(1) * 1000,
                },
                code => ExchangeError::Rejected {
                    code: Some(code),
                    reason: err.msg,
                },
            },
            Err(_) => ExchangeError::Api {
                status: s,
                message: body.to_string(),
            },
        },
    }
}

fn transport_error(timeout: Duration) -> impl Fn(reqwest::Error) -> ExchangeError {
    move |e| {
        if e.is_timeout() {
            ExchangeError::Timeout(timeout.as_millis() as u64)
        } else {
            ExchangeError::Network(e.to_string())
        }
    }
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Client order ids Binance accepts.
fn valid_client_order_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 36
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/' | '_' | '-'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Auth {
    None,
    /// API key header only
    ApiKey,
    /// API key header plus query signature
    Signed,
}

struct Inner {
    config: BinanceConfig,
    client: Client,
    signer: Option<Arc<dyn RequestSigner>>,
    limiter: RateLimiter,
    listen_key: Mutex<Option<String>>,
}

impl Inner {
    fn signer(&self) -> Result<&Arc<dyn RequestSigner>, ExchangeError> {
        self.signer.as_ref().ok_or_else(|| {
            ExchangeError::Configuration(format!("{}: no API credentials configured", self.config.id))
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        auth: Auth,
        limit_key: &str,
    ) -> Result<String, ExchangeError> {
        let operation = format!("{} {}", method, path);
        self.config
            .retry
            .run(&operation, || self.request_once(method.clone(), path, params, auth, limit_key))
            .await
    }

    /// Send a new order. A rejected rate-limit request never reached the
    /// matching engine and is retried; any other failure is returned as is,
    /// since the order may be live and resending would duplicate it.
    async fn submit(&self, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        self.config
            .retry
            .run_when(
                "POST /api/v3/order",
                |e| matches!(e, ExchangeError::RateLimited { .. }),
                || self.request_once(Method::POST, "/api/v3/order", params, Auth::Signed, ORDER_KEY),
            )
            .await
    }

    async fn request_once(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        auth: Auth,
        limit_key: &str,
    ) -> Result<String, ExchangeError> {
        self.limiter.acquire(limit_key).await;

        let mut query = encode_query(params);
        let signer = match auth {
            Auth::None => None,
            Auth::ApiKey | Auth::Signed => Some(self.signer()?),
        };
        if let (Auth::Signed, Some(signer)) = (auth, signer) {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!(
                "recvWindow={}&timestamp={}",
                self.config.recv_window_ms,
                Utc::now().timestamp_millis()
            ));
            let signature = signer.sign(&query)?;
            query.push_str(&format!("&signature={}", signature));
        }

        let base = self.config.rest_url.trim_end_matches('/');
        let url = if query.is_empty() {
            format!("{}{}", base, path)
        } else {
            format!("{}{}?{}", base, path, query)
        };
        debug!(%method, path, "Binance request");

        let mut builder = self.client.request(method, &url);
        if let Some(signer) = signer {
            builder = builder.header(API_KEY_HEADER, signer.api_key());
        }
        let to_error = transport_error(self.config.timeout);
        let resp = builder.send().await.map_err(&to_error)?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let text = resp
            .text()
            .await
            .map_err(|e| ExchangeError::Decode(format!("reading response body: {}", e)))?;

        if status.is_success() {
            Ok(text)
        } else {
            Err(classify(status, retry_after, &text))
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, ExchangeError> {
        serde_json::from_str(body).map_err(|e| ExchangeError::Decode(e.to_string()))
    }

    async fn keepalive_listen_key(self: Arc<Self>, listen_key: String, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(LISTEN_KEY_KEEPALIVE);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let params = [("listenKey", listen_key.clone())];
                    match self.request(Method::PUT, "/api/v3/userDataStream", &params, Auth::ApiKey, ACCOUNT_KEY).await {
                        Ok(_) => debug!("Listen key refreshed"),
                        Err(e) => warn!("Listen key keepalive failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Binance spot connector.
pub struct BinanceConnector {
    inner: Arc<Inner>,
}

impl BinanceConnector {
    pub fn new(config: BinanceConfig) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExchangeError::Configuration(e.to_string()))?;
        let limiter = RateLimiter::from_rules(&config.rate_limits)?;
        let signer = config
            .credentials
            .clone()
            .map(|c| Arc::new(HmacSigner::new(c)) as Arc<dyn RequestSigner>);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client,
                signer,
                limiter,
                listen_key: Mutex::new(None),
            }),
        })
    }

    pub fn from_env() -> Result<Self, ExchangeError> {
        Self::new(BinanceConfig::from_env()?)
    }

    /// Replace the HMAC signer, e.g. with a key held elsewhere.
    pub fn with_signer(self, signer: Arc<dyn RequestSigner>) -> Result<Self, ExchangeError> {
        let inner = Arc::try_unwrap(self.inner).map_err(|_| {
            ExchangeError::Configuration("signer must be set before the connector is shared".into())
        })?;
        Ok(Self {
            inner: Arc::new(Inner {
                signer: Some(signer),
                ..inner
            }),
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    fn ws_url(&self, stream: &str) -> String {
        format!("{}/ws/{}", self.inner.config.ws_url.trim_end_matches('/'), stream)
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    fn id(&self) -> &str {
        &self.inner.config.id
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        self.inner
            .request(Method::GET, "/api/v3/ping", &[], Auth::None, MARKET_KEY)
            .await?;
        if self.inner.signer.is_some() {
            self.get_balances().await?;
        }
        info!(exchange = %self.id(), "Connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ExchangeError> {
        let listen_key = self
            .inner
            .listen_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(key) = listen_key {
            let params = [("listenKey", key)];
            self.inner
                .request(Method::DELETE, "/api/v3/userDataStream", &params, Auth::ApiKey, ACCOUNT_KEY)
                .await?;
        }
        info!(exchange = %self.id(), "Disconnected");
        Ok(())
    }

    async fn place_order(&self, spec: &OrderSpec) -> Result<OrderAck, ExchangeError> {
        spec.validate().map_err(ExchangeError::InvalidRequest)?;
        let client_order_id = spec
            .client_order_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        if !valid_client_order_id(&client_order_id) {
            return Err(ExchangeError::InvalidRequest(format!(
                "invalid client order id: {}",
                client_order_id
            )));
        }

        let mut params = vec![
            ("symbol", spec.symbol.clone()),
            ("side", spec.side.to_string()),
            ("type", spec.order_type.to_string()),
            ("quantity", spec.quantity.normalize().to_string()),
            ("newClientOrderId", client_order_id),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if let (OrderType::Limit, Some(price)) = (spec.order_type, spec.price) {
            params.push(("price", price.normalize().to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }

        let body = self.inner.submit(&params).await?;
        let ack = Inner::decode::<BinanceOrder>(&body)?.into_ack()?;
        info!(
            exchange = %self.id(),
            symbol = %spec.symbol,
            side = %spec.side,
            quantity = %spec.quantity,
            order_id = %ack.exchange_order_id,
            status = %ack.report.status,
            "Order placed"
        );
        Ok(ack)
    }

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<(), ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", exchange_order_id.to_string()),
        ];
        self.inner
            .request(Method::DELETE, "/api/v3/order", &params, Auth::Signed, ORDER_KEY)
            .await?;
        info!(exchange = %self.id(), symbol, order_id = exchange_order_id, "Order cancelled");
        Ok(())
    }

    async fn get_order_status(&self, symbol: &str, order: OrderRef<'_>) -> Result<OrderAck, ExchangeError> {
        let lookup = match order {
            OrderRef::Exchange(id) => ("orderId", id.to_string()),
            OrderRef::Client(id) => ("origClientOrderId", id.to_string()),
        };
        let params = [("symbol", symbol.to_string()), lookup];
        let body = self
            .inner
            .request(Method::GET, "/api/v3/order", &params, Auth::Signed, ACCOUNT_KEY)
            .await?;
        Inner::decode::<BinanceOrder>(&body)?.into_ack()
    }

    async fn get_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        let body = self
            .inner
            .request(Method::GET, "/api/v3/account", &[], Auth::Signed, ACCOUNT_KEY)
            .await?;
        let account: BinanceAccount = Inner::decode(&body)?;

        let mut balances = Vec::new();
        for b in account.balances {
            let balance = Balance::new(b.asset, decimal(&b.free)?, decimal(&b.locked)?);
            if !balance.total().is_zero() {
                balances.push(balance);
            }
        }
        Ok(balances)
    }

    async fn get_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Bar>, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", timeframe.as_str().to_string()),
            ("limit", limit.clamp(1, 1000).to_string()),
        ];
        let body = self
            .inner
            .request(Method::GET, "/api/v3/klines", &params, Auth::None, MARKET_KEY)
            .await?;

        // [open time, open, high, low, close, volume, close time, ...]
        let rows: Vec<Vec<serde_json::Value>> = Inner::decode(&body)?;
        let field = |row: &[serde_json::Value], i: usize| -> Result<f64, ExchangeError> {
            row.get(i)
                .and_then(|v| v.as_str())
                .ok_or_else(|| ExchangeError::Decode(format!("kline field {} missing", i)))
                .and_then(float)
        };

        let mut bars = Vec::with_capacity(rows.len());
        for row in &rows {
            let row = row.as_slice();
            let open_time = row
                .first()
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ExchangeError::Decode("kline open time missing".into()))?;
            bars.push(Bar::new(
                open_time,
                field(row, 1)?,
                field(row, 2)?,
                field(row, 3)?,
                field(row, 4)?,
                field(row, 5)?,
            ));
        }
        debug!(symbol, %timeframe, count = bars.len(), "Fetched candles");
        Ok(bars)
    }

    async fn subscribe_market_data(
        &self,
        symbols: &[String],
        channels: &[MarketChannel],
        sink: mpsc::Sender<MarketEvent>,
    ) -> Result<SubscriptionHandle, ExchangeError> {
        if symbols.is_empty() || channels.is_empty() {
            return Err(ExchangeError::InvalidRequest(
                "subscription needs at least one symbol and one channel".into(),
            ));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = mpsc::channel(STATUS_CAPACITY);
        let mut tasks = Vec::new();

        for symbol in symbols {
            for channel in channels {
                let stream = format!("{}@{}", symbol.to_lowercase(), channel);
                let supervisor = StreamSupervisor::new(
                    self.id(),
                    stream.clone(),
                    self.ws_url(&stream),
                    self.inner.config.stream.clone(),
                    status_tx.clone(),
                );
                let handler = MarketStreamHandler {
                    exchange: self.id().to_string(),
                    sink: sink.clone(),
                };
                tasks.push(tokio::spawn(supervisor.run(handler, shutdown_rx.clone())));
            }
        }
        info!(exchange = %self.id(), streams = tasks.len(), "Market data subscribed");

        Ok(SubscriptionHandle::new(shutdown_tx, tasks, status_rx))
    }

    async fn subscribe_user_data(
        &self,
        orders: mpsc::Sender<OrderEvent>,
        positions: mpsc::Sender<PositionEvent>,
    ) -> Result<SubscriptionHandle, ExchangeError> {
        let body = self
            .inner
            .request(Method::POST, "/api/v3/userDataStream", &[], Auth::ApiKey, ACCOUNT_KEY)
            .await?;
        let ListenKey { listen_key } = Inner::decode(&body)?;
        *self.inner.listen_key.lock().unwrap_or_else(|e| e.into_inner()) = Some(listen_key.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = mpsc::channel(STATUS_CAPACITY);
        let supervisor = StreamSupervisor::new(
            self.id(),
            "user_data",
            self.ws_url(&listen_key),
            self.inner.config.stream.clone(),
            status_tx,
        );
        let handler = UserStreamHandler {
            exchange: self.id().to_string(),
            orders,
            positions,
        };

        let tasks = vec![
            tokio::spawn(supervisor.run(handler, shutdown_rx.clone())),
            tokio::spawn(self.inner.clone().keepalive_listen_key(listen_key, shutdown_rx)),
        ];
        info!(exchange = %self.id(), "User data subscribed");

        Ok(SubscriptionHandle::new(shutdown_tx, tasks, status_rx))
    }
}

/// Parse a public market-data frame. Frames of other kinds yield `None`.
fn parse_market_event(exchange: &str, text: &str) -> Result<Option<MarketEvent>, ExchangeError> {
    let message: StreamMessage = Inner::decode(text)?;
    let event = match message {
        StreamMessage::Trade {
            symbol,
            price,
            quantity,
            trade_time,
        } => MarketEvent::Trade {
            exchange: exchange.to_string(),
            symbol,
            price: decimal(&price)?,
            quantity: decimal(&quantity)?,
            timestamp: trade_time,
        },
        StreamMessage::Ticker {
            event_time,
            symbol,
            bid,
            ask,
            last,
        } => MarketEvent::Ticker {
            exchange: exchange.to_string(),
            symbol,
            bid: decimal(&bid)?,
            ask: decimal(&ask)?,
            last: decimal(&last)?,
            timestamp: event_time,
        },
        StreamMessage::Kline { symbol, kline } => MarketEvent::Kline {
            exchange: exchange.to_string(),
            symbol,
            timeframe: kline
                .interval
                .parse()
                .map_err(ExchangeError::Decode)?,
            bar: Bar::new(
                kline.open_time,
                float(&kline.open)?,
                float(&kline.high)?,
                float(&kline.low)?,
                float(&kline.close)?,
                float(&kline.volume)?,
            ),
            closed: kline.closed,
        },
        _ => return Ok(None),
    };
    Ok(Some(event))
}

enum UserEvent {
    Order(OrderEvent),
    Balances(Vec<PositionEvent>),
}

fn parse_user_event(exchange: &str, text: &str) -> Result<Option<UserEvent>, ExchangeError> {
    let message: StreamMessage = Inner::decode(text)?;
    let event = match message {
        StreamMessage::ExecutionReport {
            symbol,
            client_order_id,
            orig_client_order_id,
            status,
            reject_reason,
            order_id,
            cumulative_qty,
            cumulative_quote_qty,
            transaction_time,
        } => {
            let report = execution_report(&status, &cumulative_qty, &cumulative_quote_qty, Some(&reject_reason))?;
            let client_order_id = if orig_client_order_id.is_empty() {
                client_order_id
            } else {
                orig_client_order_id
            };
            UserEvent::Order(OrderEvent {
                exchange: exchange.to_string(),
                symbol,
                exchange_order_id: Some(order_id.to_string()),
                client_order_id: Some(client_order_id),
                report,
                timestamp: timestamp(transaction_time),
            })
        }
        StreamMessage::AccountPosition {
            event_time,
            balances,
        } => {
            let mut events = Vec::with_capacity(balances.len());
            for b in balances {
                events.push(PositionEvent {
                    exchange: exchange.to_string(),
                    asset: b.asset,
                    free: decimal(&b.free)?,
                    locked: decimal(&b.locked)?,
                    timestamp: timestamp(event_time),
                });
            }
            UserEvent::Balances(events)
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

struct MarketStreamHandler {
    exchange: String,
    sink: mpsc::Sender<MarketEvent>,
}

#[async_trait]
impl StreamHandler for MarketStreamHandler {
    async fn handle(&mut self, text: &str) -> bool {
        match parse_market_event(&self.exchange, text) {
            Ok(Some(event)) => self.sink.send(event).await.is_ok(),
            Ok(None) => true,
            Err(e) => {
                debug!("Skipping market frame: {}", e);
                true
            }
        }
    }
}

struct UserStreamHandler {
    exchange: String,
    orders: mpsc::Sender<OrderEvent>,
    positions: mpsc::Sender<PositionEvent>,
}

#[async_trait]
impl StreamHandler for UserStreamHandler {
    async fn handle(&mut self, text: &str) -> bool {
        match parse_user_event(&self.exchange, text) {
            Ok(Some(UserEvent::Order(event))) => self.orders.send(event).await.is_ok(),
            Ok(Some(UserEvent::Balances(events))) => {
                for event in events {
                    if self.positions.send(event).await.is_err() {
                        return false;
                    }
                }
                true
            }
            Ok(None) => true,
            Err(e) => {
                debug!("Skipping user data frame: {}", e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use rust_decimal_macros::dec;
    use trading_core::types::Side;

    fn connector(server: &mockito::ServerGuard) -> BinanceConnector {
        let mut config = BinanceConfig::new(server.url(), "ws://127.0.0.1:1")
            .with_credentials(Credentials::new("test-key", "test-secret"));
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: 0.0,
        };
        BinanceConnector::new(config).unwrap()
    }

    fn signed() -> Matcher {
        Matcher::Regex("timestamp=\\d+&signature=[0-9a-f]{64}$".into())
    }

    #[tokio::test]
    async fn test_place_market_order() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v3/order")
            .match_header(API_KEY_HEADER, "test-key")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::UrlEncoded("side".into(), "BUY".into()),
                Matcher::UrlEncoded("type".into(), "MARKET".into()),
                Matcher::UrlEncoded("quantity".into(), "0.5".into()),
                Matcher::UrlEncoded("newClientOrderId".into(), "cid-1".into()),
                signed(),
            ]))
            .with_status(200)
            .with_body(
                r#"{"symbol":"BTCUSDT","orderId":28,"clientOrderId":"cid-1","transactTime":1507725176595,
                    "price":"0.00000000","origQty":"0.50000000","executedQty":"0.50000000",
                    "cummulativeQuoteQty":"25000.00000000","status":"FILLED","type":"MARKET","side":"BUY"}"#,
            )
            .create_async()
            .await;

        let spec = OrderSpec::market("binance", "BTCUSDT", Side::Buy, dec!(0.5)).with_client_order_id("cid-1");
        let ack = connector(&server).place_order(&spec).await.unwrap();

        assert_eq!(ack.exchange_order_id, "28");
        assert_eq!(ack.client_order_id, "cid-1");
        assert_eq!(ack.report.status, OrderStatus::Filled);
        assert_eq!(ack.report.executed_qty, dec!(0.5));
        assert_eq!(ack.report.avg_price, Some(dec!(50000)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_limit_order_params() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v3/order")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("type".into(), "LIMIT".into()),
                Matcher::UrlEncoded("price".into(), "3000".into()),
                Matcher::UrlEncoded("timeInForce".into(), "GTC".into()),
            ]))
            .with_body(
                r#"{"symbol":"ETHUSDT","orderId":5,"clientOrderId":"x","executedQty":"0","cummulativeQuoteQty":"0","status":"NEW"}"#,
            )
            .create_async()
            .await;

        let spec = OrderSpec::limit("binance", "ETHUSDT", Side::Sell, dec!(1), dec!(3000.00));
        let ack = connector(&server).place_order(&spec).await.unwrap();
        assert_eq!(ack.report.status, OrderStatus::Open);
        assert_eq!(ack.report.avg_price, None);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_reject_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v3/order")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#)
            .expect(1)
            .create_async()
            .await;

        let spec = OrderSpec::market("binance", "BTCUSDT", Side::Buy, dec!(10));
        let err = connector(&server).place_order(&spec).await.unwrap_err();
        assert_eq!(
            err,
            ExchangeError::Rejected {
                code: Some(-2010),
                reason: "Account has insufficient balance for requested action.".into()
            }
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_order_post_is_not_resent_after_server_error() {
        let mut server = mockito::Server::new_async().await;
        let post = server
            .mock("POST", "/api/v3/order")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("Service Unavailable")
            .expect(1)
            .create_async()
            .await;
        let duplicate = server
            .mock("POST", "/api/v3/order")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-2010,"msg":"Duplicate order sent."}"#)
            .expect(0)
            .create_async()
            .await;

        let spec = OrderSpec::limit("binance", "BTCUSDT", Side::Buy, dec!(1), dec!(50000))
            .with_client_order_id("cid-dup");
        let err = connector(&server).place_order(&spec).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Api { status: 503, .. }));
        assert!(err.is_transient());
        post.assert_async().await;
        duplicate.assert_async().await;

        let lookup = server
            .mock("GET", "/api/v3/order")
            .match_query(Matcher::UrlEncoded("origClientOrderId".into(), "cid-dup".into()))
            .with_body(
                r#"{"symbol":"BTCUSDT","orderId":77,"clientOrderId":"cid-dup","executedQty":"0","cummulativeQuoteQty":"0","status":"NEW"}"#,
            )
            .create_async()
            .await;
        let ack = connector(&server)
            .get_order_status("BTCUSDT", OrderRef::Client("cid-dup"))
            .await
            .unwrap();
        assert_eq!(ack.exchange_order_id, "77");
        assert_eq!(ack.report.status, OrderStatus::Open);
        lookup.assert_async().await;
    }

    #[tokio::test]
    async fn test_truncated_body_is_a_decode_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n{\"balances\"")
                .await;
        });

        let mut config =
            BinanceConfig::new(url, "ws://127.0.0.1:1").with_credentials(Credentials::new("test-key", "test-secret"));
        config.retry = RetryPolicy::none();
        let err = BinanceConnector::new(config).unwrap().get_balances().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Decode(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/account")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"code":-2015,"msg":"Invalid API-key, IP, or permissions for action."}"#)
            .expect(1)
            .create_async()
            .await;

        let err = connector(&server).get_balances().await.unwrap_err();
        assert!(err.is_fatal());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("Service Unavailable")
            .expect(3)
            .create_async()
            .await;

        let err = connector(&server)
            .get_candles("BTCUSDT", Timeframe::Hour1, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Api { status: 503, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_candles() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::UrlEncoded("interval".into(), "1h".into()),
                Matcher::UrlEncoded("limit".into(), "2".into()),
            ]))
            .with_body(
                r#"[[1700000000000,"100.0","110.0","95.0","105.0","12.5",1700003599999,"0",10,"0","0","0"],
                    [1700003600000,"105.0","108.0","101.0","107.5","8.0",1700007199999,"0",8,"0","0","0"]]"#,
            )
            .create_async()
            .await;

        let bars = connector(&server).get_candles("BTCUSDT", Timeframe::Hour1, 2).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp, 1_700_000_000_000);
        assert_eq!(bars[0].high, 110.0);
        assert_eq!(bars[1].close, 107.5);
        assert_eq!(bars[1].volume, 8.0);
    }

    #[tokio::test]
    async fn test_balances_skip_empty_assets() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/account")
            .match_query(signed())
            .with_body(
                r#"{"makerCommission":15,"balances":[
                    {"asset":"BTC","free":"0.10000000","locked":"0.00000000"},
                    {"asset":"LTC","free":"0.00000000","locked":"0.00000000"},
                    {"asset":"USDT","free":"900.00000000","locked":"100.00000000"}]}"#,
            )
            .create_async()
            .await;

        let balances = connector(&server).get_balances().await.unwrap();
        assert_eq!(balances.len(), 2);
        assert_eq!(balances[1].asset, "USDT");
        assert_eq!(balances[1].total(), dec!(1000));
    }

    #[tokio::test]
    async fn test_order_status_by_client_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/order")
            .match_query(Matcher::UrlEncoded("origClientOrderId".into(), "cid-9".into()))
            .with_status(400)
            .with_body(r#"{"code":-2013,"msg":"Order does not exist."}"#)
            .create_async()
            .await;

        let err = connector(&server)
            .get_order_status("BTCUSDT", OrderRef::Client("cid-9"))
            .await
            .unwrap_err();
        assert_eq!(err, ExchangeError::OrderNotFound("Order does not exist.".into()));
    }

    #[tokio::test]
    async fn test_contract_errors_skip_network() {
        let server = mockito::Server::new_async().await;
        let binance = connector(&server);

        let zero = OrderSpec::market("binance", "BTCUSDT", Side::Buy, Decimal::ZERO);
        assert!(matches!(binance.place_order(&zero).await, Err(ExchangeError::InvalidRequest(_))));

        let bad_id = OrderSpec::market("binance", "BTCUSDT", Side::Buy, dec!(1)).with_client_order_id("a b");
        assert!(matches!(binance.place_order(&bad_id).await, Err(ExchangeError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_signed_call_without_credentials() {
        let server = mockito::Server::new_async().await;
        let binance = BinanceConnector::new(BinanceConfig::new(server.url(), "ws://127.0.0.1:1")).unwrap();
        assert!(matches!(binance.get_balances().await, Err(ExchangeError::Configuration(_))));
    }

    #[test]
    fn test_parse_market_frames() {
        let trade = r#"{"e":"trade","E":123456789,"s":"BNBBTC","t":12345,"p":"0.001","q":"100","T":123456785,"m":true,"M":true}"#;
        assert_eq!(
            parse_market_event("binance", trade).unwrap(),
            Some(MarketEvent::Trade {
                exchange: "binance".into(),
                symbol: "BNBBTC".into(),
                price: dec!(0.001),
                quantity: dec!(100),
                timestamp: 123456785,
            })
        );

        let kline = r#"{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":1700000000000,"T":1700003599999,"s":"BTCUSDT","i":"1h","o":"100","c":"104","h":"105","l":"99","v":"12","x":true}}"#;
        match parse_market_event("binance", kline).unwrap() {
            Some(MarketEvent::Kline { timeframe, bar, closed, .. }) => {
                assert_eq!(timeframe, Timeframe::Hour1);
                assert_eq!(bar.close, 104.0);
                assert!(closed);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(parse_market_event("binance", "not json").is_err());
    }

    #[test]
    fn test_parse_execution_report() {
        let text = r#"{"e":"executionReport","E":1499405658658,"s":"ETHBTC","c":"web_1","C":"cid-7","S":"BUY","o":"LIMIT",
            "q":"2.00000000","p":"0.10264410","X":"PARTIALLY_FILLED","r":"NONE","i":4293153,"l":"1.00000000",
            "z":"1.00000000","L":"0.10000000","Z":"0.10000000","T":1499405658657}"#;
        match parse_user_event("binance", text).unwrap() {
            Some(UserEvent::Order(event)) => {
                assert_eq!(event.client_order_id.as_deref(), Some("cid-7"));
                assert_eq!(event.exchange_order_id.as_deref(), Some("4293153"));
                assert_eq!(event.report.status, OrderStatus::PartiallyFilled);
                assert_eq!(event.report.executed_qty, dec!(1));
                assert_eq!(event.report.avg_price, Some(dec!(0.1)));
            }
            _ => panic!("expected an order event"),
        }

        let balances = r#"{"e":"outboundAccountPosition","E":1564034571105,"u":1564034571073,
            "B":[{"a":"ETH","f":"10000.000000","l":"0.000000"}]}"#;
        match parse_user_event("binance", balances).unwrap() {
            Some(UserEvent::Balances(events)) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].free, dec!(10000));
            }
            _ => panic!("expected balance events"),
        }
    }

    #[test]
    fn test_rejected_report_reason() {
        let report = execution_report("REJECTED", "0", "0", Some("INSUFFICIENT_BALANCE")).unwrap();
        assert_eq!(report.reject_reason.as_deref(), Some("INSUFFICIENT_BALANCE"));
        let report = execution_report("REJECTED", "0", "0", Some("NONE")).unwrap();
        assert_eq!(report.reject_reason.as_deref(), Some("rejected by exchange"));
        assert!(map_status("WHATEVER").is_err());
    }
}

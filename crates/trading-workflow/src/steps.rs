//! Steps of the trading pipeline.
//!
//! Each step reads its inputs from the [`WorkflowContext`] under the name of
//! the step that produced them and stores its own output under its name.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use trading_core::error::StrategyError;
use trading_core::traits::{MarketDataSource, SignalGenerator};
use trading_core::types::{Bar, Order, OrderSpec, Position, Side, Signal, SignalType, Timeframe};
use trading_data::PriceCache;
use trading_orders::{OrderError, OrderManager};
use trading_risk::RiskManager;
use trading_strategies::{AggregationResult, SignalAggregator};

use crate::artifacts::ArtifactWriter;
use crate::context::WorkflowContext;
use crate::engine::WorkflowStep;
use crate::error::StepError;
use crate::pipeline::PipelineConfig;

pub const INGEST: &str = "ingest_market_data";
pub const CLEAN: &str = "clean_data";
pub const GENERATE: &str = "generate_signals";
pub const AGGREGATE: &str = "aggregate_signals";
/// Net positions of the signalled symbols before any branch executes
pub const HELD: &str = "held_positions";
pub const PERSIST: &str = "persist_artifacts";
pub const MONITOR: &str = "monitor_positions";

/// Name of the execution branch for `exchange`.
pub fn execute_step_name(exchange: &str) -> String {
    format!("execute_{}", exchange)
}

/// Candle histories keyed by (symbol, timeframe).
pub type CandleSet = BTreeMap<(String, Timeframe), Vec<Bar>>;

/// Output of the ingestion and cleaning steps.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub candles: CandleSet,
    /// Pairs that could not be fetched
    pub failures: Vec<String>,
}

impl MarketSnapshot {
    /// Close of the most recent bar of `symbol` across all timeframes.
    pub fn last_close(&self, symbol: &str) -> Option<f64> {
        self.candles
            .iter()
            .filter(|((s, _), _)| s == symbol)
            .filter_map(|(_, bars)| bars.last())
            .max_by_key(|bar| bar.timestamp)
            .map(|bar| bar.close)
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.candles.keys().map(|(s, _)| s.clone()).collect();
        symbols.dedup();
        symbols
    }
}

/// What one execution branch did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionSummary {
    pub exchange: String,
    /// Orders created by this branch, rejected ones included
    pub orders: Vec<Order>,
    pub skipped: Vec<String>,
    pub rejected: Vec<String>,
    pub errors: Vec<String>,
}

impl ExecutionSummary {
    fn new(exchange: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            ..Default::default()
        }
    }
}

/// Drop malformed bars, sort by open time and keep the last of any
/// duplicate timestamps.
pub fn clean_bars(bars: &[Bar]) -> Vec<Bar> {
    let mut by_time = BTreeMap::new();
    for bar in bars.iter().filter(|bar| bar.is_well_formed()) {
        by_time.insert(bar.timestamp, *bar);
    }
    by_time.into_values().collect()
}

/// Everything the steps share across runs.
#[derive(Clone)]
pub(crate) struct Shared {
    pub config: Arc<PipelineConfig>,
    pub data: Arc<dyn MarketDataSource>,
    pub strategies: Arc<Mutex<Vec<Box<dyn SignalGenerator>>>>,
    pub aggregator: Arc<SignalAggregator>,
    pub risk: Arc<RiskManager>,
    pub orders: Arc<OrderManager>,
    pub prices: Option<Arc<PriceCache>>,
    pub artifacts: Option<ArtifactWriter>,
}

pub(crate) struct IngestStep(pub Shared);

#[async_trait]
impl WorkflowStep for IngestStep {
    fn name(&self) -> &str {
        INGEST
    }

    async fn run(&self, ctx: &WorkflowContext) -> Result<(), StepError> {
        let config = &self.0.config;
        let pairs: Vec<(String, Timeframe)> = config
            .symbols
            .iter()
            .flat_map(|symbol| config.timeframes.iter().map(move |tf| (symbol.clone(), *tf)))
            .collect();

        let fetches = pairs.iter().map(|(symbol, tf)| {
            self.0.data.get_candles(symbol, *tf, config.candle_limit)
        });
        let results = join_all(fetches).await;

        let mut snapshot = MarketSnapshot::default();
        for ((symbol, tf), result) in pairs.into_iter().zip(results) {
            match result {
                Ok(bars) if !bars.is_empty() => {
                    snapshot.candles.insert((symbol, tf), bars);
                }
                Ok(_) => {
                    warn!(symbol = %symbol, timeframe = %tf, "No candles returned");
                    snapshot.failures.push(format!("{}/{}: no candles", symbol, tf));
                }
                Err(e) => {
                    warn!(symbol = %symbol, timeframe = %tf, error = %e, "Candle fetch failed");
                    snapshot.failures.push(format!("{}/{}: {}", symbol, tf, e));
                }
            }
        }

        if snapshot.candles.is_empty() {
            return Err(StepError::Failed(format!(
                "no market data from {}: {}",
                self.0.data.name(),
                snapshot.failures.join("; ")
            )));
        }

        info!(
            source = self.0.data.name(),
            pairs = snapshot.candles.len(),
            failed = snapshot.failures.len(),
            "Market data ingested"
        );
        ctx.insert(INGEST, snapshot);
        Ok(())
    }
}

pub(crate) struct CleanStep(pub Shared);

#[async_trait]
impl WorkflowStep for CleanStep {
    fn name(&self) -> &str {
        CLEAN
    }

    async fn run(&self, ctx: &WorkflowContext) -> Result<(), StepError> {
        let raw = ctx.require::<MarketSnapshot>(INGEST)?;
        let mut cleaned = MarketSnapshot {
            candles: CandleSet::new(),
            failures: raw.failures.clone(),
        };
        let mut dropped = 0usize;

        for (key, bars) in &raw.candles {
            let bars_clean = clean_bars(bars);
            dropped += bars.len() - bars_clean.len();
            if bars_clean.is_empty() {
                cleaned.failures.push(format!("{}/{}: no valid candles", key.0, key.1));
                continue;
            }
            cleaned.candles.insert(key.clone(), bars_clean);
        }

        if let Some(prices) = &self.0.prices {
            for symbol in cleaned.symbols() {
                if let Some(close) = cleaned.last_close(&symbol) {
                    if let Ok(price) = Decimal::try_from(close) {
                        prices.set(&symbol, price);
                    }
                }
            }
        }

        if dropped > 0 {
            warn!(dropped, "Dropped malformed or duplicate candles");
        }
        debug!(pairs = cleaned.candles.len(), "Market data cleaned");
        ctx.insert(CLEAN, cleaned);
        Ok(())
    }
}

pub(crate) struct GenerateStep(pub Shared);

#[async_trait]
impl WorkflowStep for GenerateStep {
    fn name(&self) -> &str {
        GENERATE
    }

    async fn run(&self, ctx: &WorkflowContext) -> Result<(), StepError> {
        let market = ctx.require::<MarketSnapshot>(CLEAN)?;
        let mut signals = Vec::new();

        {
            let mut strategies = self
                .0
                .strategies
                .lock()
                .map_err(|_| StepError::Failed("strategy set poisoned".to_string()))?;

            for generator in strategies.iter_mut() {
                for ((symbol, tf), bars) in &market.candles {
                    generator.update_data(symbol, *tf, bars);
                    match generator.generate_signals(symbol, *tf) {
                        Ok(batch) => {
                            for signal in batch {
                                match signal.validate() {
                                    Ok(()) => signals.push(signal),
                                    Err(e) => warn!(
                                        strategy = generator.name(),
                                        symbol = %symbol,
                                        "Malformed signal dropped: {}", e
                                    ),
                                }
                            }
                        }
                        Err(StrategyError::InsufficientData { required, available }) => debug!(
                            strategy = generator.name(),
                            symbol = %symbol,
                            timeframe = %tf,
                            required,
                            available,
                            "Strategy warming up"
                        ),
                        Err(e) => warn!(
                            strategy = generator.name(),
                            symbol = %symbol,
                            timeframe = %tf,
                            "Signal generation failed: {}", e
                        ),
                    }
                }
            }
        }

        info!(signals = signals.len(), "Signals generated");
        ctx.insert(GENERATE, signals);
        Ok(())
    }
}

pub(crate) struct AggregateStep(pub Shared);

#[async_trait]
impl WorkflowStep for AggregateStep {
    fn name(&self) -> &str {
        AGGREGATE
    }

    async fn run(&self, ctx: &WorkflowContext) -> Result<(), StepError> {
        let signals = ctx.require::<Vec<Signal>>(GENERATE)?;
        let result = self
            .0
            .aggregator
            .process(signals.as_ref().clone(), Utc::now().timestamp_millis());

        for consensus in &result.consensus {
            info!(
                symbol = %consensus.symbol,
                direction = ?consensus.signal_type,
                score = consensus.score,
                strategies = consensus.contributing_strategies.len(),
                "Consensus signal"
            );
        }
        info!(
            filtered = result.filtered.len(),
            consensus = result.consensus.len(),
            exits = result.exits.len(),
            "Signals aggregated"
        );
        let account = &self.0.config.account;
        let book = self.0.orders.positions();
        let held: BTreeMap<String, Decimal> = result
            .consensus
            .iter()
            .map(|c| c.symbol.as_str())
            .chain(result.exits.iter().map(|s| s.symbol.as_str()))
            .map(|symbol| (symbol.to_string(), book.net_quantity(account, symbol)))
            .collect();

        ctx.insert(HELD, held);
        ctx.insert(AGGREGATE, result);
        Ok(())
    }
}

/// Turns consensus into orders on one exchange.
///
/// Every branch sizes against the positions held before execution started,
/// so parallel branches see the same book. Exit signals are only acted on by the primary branch so a position is
/// never closed twice.
pub(crate) struct ExecuteStep {
    pub shared: Shared,
    pub exchange: String,
    pub name: String,
    pub primary: bool,
}

impl ExecuteStep {
    pub fn new(shared: Shared, exchange: &str, primary: bool) -> Self {
        Self {
            shared,
            exchange: exchange.to_string(),
            name: execute_step_name(exchange),
            primary,
        }
    }

    fn spec(&self, symbol: &str, side: Side, quantity: Decimal) -> OrderSpec {
        let spec = OrderSpec::market(&self.exchange, symbol, side, quantity);
        match &self.shared.config.agent_id {
            Some(agent) => spec.with_agent(agent.clone()),
            None => spec,
        }
    }

    async fn submit(&self, spec: OrderSpec, summary: &mut ExecutionSummary) {
        let account = &self.shared.config.account;
        match self.shared.orders.create_order(account, spec).await {
            Ok(order) => summary.orders.push(order),
            Err(
                OrderError::RiskRejected { order_id, reason }
                | OrderError::ExchangeRejected { order_id, reason },
            ) => {
                summary.rejected.push(reason);
                if let Some(order) = self.shared.orders.get_order(order_id) {
                    summary.orders.push(order);
                }
            }
            Err(e) => {
                warn!(exchange = %self.exchange, "Order submission failed: {}", e);
                summary.errors.push(e.to_string());
            }
        }
    }
}

#[async_trait]
impl WorkflowStep for ExecuteStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &WorkflowContext) -> Result<(), StepError> {
        let result = ctx.require::<AggregationResult>(AGGREGATE)?;
        let held = ctx.require::<BTreeMap<String, Decimal>>(HELD)?;
        let net_of = |symbol: &str| held.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let config = &self.shared.config;
        let mut summary = ExecutionSummary::new(&self.exchange);

        let account_value = if result.consensus.is_empty() {
            None
        } else {
            match self.shared.risk.account_value(&config.account).await {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(account = %config.account, "Account value unavailable, entries skipped: {}", e);
                    None
                }
            }
        };

        for consensus in &result.consensus {
            let Some(account_value) = account_value else {
                summary.skipped.push(format!("{}: account value unavailable", consensus.symbol));
                continue;
            };
            let side = consensus.side();
            let net = net_of(&consensus.symbol);
            if (side == Side::Buy && net > Decimal::ZERO) || (side == Side::Sell && net < Decimal::ZERO) {
                summary.skipped.push(format!("{}: already positioned", consensus.symbol));
                continue;
            }
            let Ok(price) = Decimal::try_from(consensus.price) else {
                summary.skipped.push(format!("{}: unusable price", consensus.symbol));
                continue;
            };
            let stop = consensus
                .constituents
                .iter()
                .find_map(|s| s.metadata.stop_loss)
                .and_then(|s| Decimal::try_from(s).ok());

            let quantity = config.sizing.calculate(account_value, price, consensus.confidence, stop);
            if quantity <= Decimal::ZERO {
                summary.skipped.push(format!("{}: size rounds to zero", consensus.symbol));
                continue;
            }
            self.submit(self.spec(&consensus.symbol, side, quantity), &mut summary).await;
        }

        if self.primary && config.close_on_exit {
            let mut closed = BTreeSet::new();
            for exit in &result.exits {
                let net = net_of(&exit.symbol);
                let quantity = match exit.signal_type {
                    SignalType::ExitBuy if net > Decimal::ZERO => net,
                    SignalType::ExitSell if net < Decimal::ZERO => -net,
                    _ => continue,
                };
                if !closed.insert(exit.symbol.clone()) {
                    continue;
                }
                info!(symbol = %exit.symbol, strategy = %exit.strategy_name, "Closing position on exit signal");
                self.submit(self.spec(&exit.symbol, exit.signal_type.side(), quantity), &mut summary)
                    .await;
            }
        }

        info!(
            exchange = %self.exchange,
            orders = summary.orders.len(),
            rejected = summary.rejected.len(),
            skipped = summary.skipped.len(),
            "Execution finished"
        );

        let failed = summary.orders.is_empty() && !summary.errors.is_empty();
        let errors = summary.errors.join("; ");
        ctx.insert(self.name.clone(), summary);
        if failed {
            return Err(StepError::Failed(errors));
        }
        Ok(())
    }
}

pub(crate) struct PersistStep {
    pub shared: Shared,
    pub exchanges: Vec<String>,
}

#[async_trait]
impl WorkflowStep for PersistStep {
    fn name(&self) -> &str {
        PERSIST
    }

    async fn run(&self, ctx: &WorkflowContext) -> Result<(), StepError> {
        let Some(writer) = &self.shared.artifacts else {
            debug!("Artifact persistence disabled");
            return Ok(());
        };
        let at = ctx.started_at();
        let mut written: Vec<PathBuf> = Vec::new();

        if let Some(raw) = ctx.get::<Vec<Signal>>(GENERATE) {
            written.push(writer.write("raw_signals", at, raw.as_ref()).await?);
        }
        if let Some(result) = ctx.get::<AggregationResult>(AGGREGATE) {
            written.push(writer.write("filtered_signals", at, &result.filtered).await?);
            written.push(writer.write("consensus_signals", at, &result.consensus).await?);
        }

        let orders: Vec<Order> = self
            .exchanges
            .iter()
            .filter_map(|exchange| ctx.get::<ExecutionSummary>(&execute_step_name(exchange)))
            .flat_map(|summary| summary.orders.clone())
            .collect();
        written.push(writer.write("executed_orders", at, &orders).await?);

        info!(files = written.len(), dir = %writer.dir().display(), "Artifacts persisted");
        ctx.insert(PERSIST, written);
        Ok(())
    }
}

pub(crate) struct MonitorStep(pub Shared);

#[async_trait]
impl WorkflowStep for MonitorStep {
    fn name(&self) -> &str {
        MONITOR
    }

    async fn run(&self, ctx: &WorkflowContext) -> Result<(), StepError> {
        let book = self.0.orders.positions();
        if let Some(market) = ctx.get::<MarketSnapshot>(CLEAN) {
            for symbol in market.symbols() {
                if let Some(price) = market.last_close(&symbol).and_then(|c| Decimal::try_from(c).ok()) {
                    book.update_mark(&symbol, price);
                }
            }
        }

        let positions: Vec<Position> = book.positions_for(&self.0.config.account);
        let unrealized: Decimal = positions.iter().map(|p| p.unrealized_pnl).sum();
        for position in &positions {
            debug!(
                symbol = %position.symbol,
                quantity = %position.quantity,
                avg_price = %position.avg_price,
                unrealized = %position.unrealized_pnl,
                "Open position"
            );
        }
        info!(
            account = %self.0.config.account,
            open = positions.len(),
            unrealized = %unrealized,
            "Positions monitored"
        );
        ctx.insert(MONITOR, positions);
        Ok(())
    }
}

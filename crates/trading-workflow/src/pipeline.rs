//! The trading pipeline: market data to orders as one workflow run.
//!
//! ```text
//! ingest_market_data -> clean_data -> generate_signals -> aggregate_signals
//!                                                              |
//!                                   execute_<exchange> (one branch each)
//!                                                              |
//!                                  persist_artifacts, monitor_positions
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use trading_core::traits::{MarketDataSource, SignalGenerator, StrategyState};
use trading_core::types::{ConsensusSignal, Order, Position, Signal, Timeframe};
use trading_data::PriceCache;
use trading_orders::OrderManager;
use trading_risk::{PositionSizer, RiskManager};
use trading_strategies::{AggregationResult, SignalAggregator};

use crate::artifacts::ArtifactWriter;
use crate::context::WorkflowContext;
use crate::engine::{Workflow, WorkflowBuilder, WorkflowReport};
use crate::error::WorkflowError;
use crate::steps::{
    execute_step_name, AggregateStep, CleanStep, ExecuteStep, ExecutionSummary, GenerateStep,
    IngestStep, MonitorStep, PersistStep, Shared, AGGREGATE, CLEAN, GENERATE, INGEST, MONITOR,
    PERSIST,
};

/// Pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Account orders are placed for
    pub account: String,
    pub agent_id: Option<String>,
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    /// Candles fetched per (symbol, timeframe)
    pub candle_limit: usize,
    /// Exchanges to execute on; empty means every registered exchange
    pub exchanges: Vec<String>,
    pub sizing: PositionSizer,
    /// Where JSON artifacts are written; `None` disables persistence
    pub artifacts_dir: Option<PathBuf>,
    pub step_timeout_ms: u64,
    /// Act on exit signals by closing the net position
    pub close_on_exit: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            account: "default".to_string(),
            agent_id: None,
            symbols: vec!["BTCUSDT".to_string()],
            timeframes: vec![Timeframe::Hour1],
            candle_limit: 200,
            exchanges: Vec::new(),
            sizing: PositionSizer::default(),
            artifacts_dir: None,
            step_timeout_ms: 120_000,
            close_on_exit: true,
        }
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub report: WorkflowReport,
    /// Validated signals from every strategy
    pub signals: Vec<Signal>,
    pub aggregation: AggregationResult,
    pub executions: Vec<ExecutionSummary>,
    pub positions: Vec<Position>,
    pub artifacts: Vec<PathBuf>,
}

impl PipelineRun {
    pub fn consensus(&self) -> &[ConsensusSignal] {
        &self.aggregation.consensus
    }

    /// Orders created across all execution branches.
    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.executions.iter().flat_map(|e| e.orders.iter())
    }

    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

/// Runs strategies, aggregation and execution as a DAG.
///
/// Strategy histories persist between runs, so calling [`run_once`] on a
/// schedule only feeds new candles to each generator.
///
/// [`run_once`]: TradingPipeline::run_once
pub struct TradingPipeline {
    shared: Shared,
}

impl TradingPipeline {
    pub fn new(
        config: PipelineConfig,
        data: Arc<dyn MarketDataSource>,
        strategies: Vec<Box<dyn SignalGenerator>>,
        aggregator: SignalAggregator,
        risk: Arc<RiskManager>,
        orders: Arc<OrderManager>,
    ) -> Self {
        let artifacts = config.artifacts_dir.as_ref().map(ArtifactWriter::new);
        Self {
            shared: Shared {
                config: Arc::new(config),
                data,
                strategies: Arc::new(Mutex::new(strategies)),
                aggregator: Arc::new(aggregator),
                risk,
                orders,
                prices: None,
                artifacts,
            },
        }
    }

    /// Publish the latest close of every symbol into `prices`.
    pub fn with_price_cache(mut self, prices: Arc<PriceCache>) -> Self {
        self.shared.prices = Some(prices);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn orders(&self) -> &Arc<OrderManager> {
        &self.shared.orders
    }

    /// Exchanges that get an execution branch.
    pub fn execution_exchanges(&self) -> Vec<String> {
        if self.shared.config.exchanges.is_empty() {
            self.shared.orders.exchanges().ids()
        } else {
            self.shared.config.exchanges.clone()
        }
    }

    pub fn strategy_states(&self) -> Vec<StrategyState> {
        match self.shared.strategies.lock() {
            Ok(strategies) => strategies.iter().map(|s| s.state()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Build the workflow graph for one run.
    pub fn workflow(&self) -> Result<Workflow, WorkflowError> {
        let shared = &self.shared;
        let exchanges = self.execution_exchanges();
        let execute_names: Vec<String> = exchanges.iter().map(|e| execute_step_name(e)).collect();
        let execute_refs: Vec<&str> = execute_names.iter().map(String::as_str).collect();

        let mut builder = WorkflowBuilder::new("trading_pipeline")
            .default_timeout(Duration::from_millis(shared.config.step_timeout_ms))
            .step(IngestStep(shared.clone()), &[])
            .step(CleanStep(shared.clone()), &[INGEST])
            .step(GenerateStep(shared.clone()), &[CLEAN])
            .step(AggregateStep(shared.clone()), &[GENERATE]);

        for (i, exchange) in exchanges.iter().enumerate() {
            builder = builder.step(ExecuteStep::new(shared.clone(), exchange, i == 0), &[AGGREGATE]);
        }

        let mut persist_after = vec![GENERATE, AGGREGATE];
        persist_after.extend(execute_refs.iter().copied());
        let monitor_after = if execute_refs.is_empty() {
            vec![AGGREGATE]
        } else {
            execute_refs.clone()
        };

        builder
            .after(
                PersistStep {
                    shared: shared.clone(),
                    exchanges: exchanges.clone(),
                },
                &persist_after,
            )
            .after(MonitorStep(shared.clone()), &monitor_after)
            .build()
    }

    /// Run the whole pipeline once.
    ///
    /// Step failures are reported in [`PipelineRun::report`]; only a
    /// malformed graph is an error.
    pub async fn run_once(&self) -> Result<PipelineRun, WorkflowError> {
        let workflow = self.workflow()?;
        let ctx = WorkflowContext::new();
        info!(run_id = %ctx.run_id(), steps = workflow.len(), "Pipeline run started");

        let report = workflow.run(&ctx).await;

        let executions: Vec<ExecutionSummary> = self
            .execution_exchanges()
            .iter()
            .filter_map(|exchange| ctx.get::<ExecutionSummary>(&execute_step_name(exchange)))
            .map(|summary| summary.as_ref().clone())
            .collect();

        let run = PipelineRun {
            signals: cloned(&ctx, GENERATE),
            aggregation: cloned(&ctx, AGGREGATE),
            positions: cloned(&ctx, MONITOR),
            artifacts: cloned(&ctx, PERSIST),
            executions,
            report,
        };

        if run.is_success() {
            info!(
                run_id = %ctx.run_id(),
                signals = run.signals.len(),
                consensus = run.consensus().len(),
                orders = run.orders().count(),
                "Pipeline run finished"
            );
        } else {
            let failed: Vec<&str> = run.report.failed().iter().map(|s| s.name.as_str()).collect();
            warn!(run_id = %ctx.run_id(), failed = ?failed, "Pipeline run finished with failures");
        }
        Ok(run)
    }
}

fn cloned<T: Clone + Default + Send + Sync + 'static>(ctx: &WorkflowContext, key: &str) -> T {
    ctx.get::<T>(key).map(|v| v.as_ref().clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.candle_limit, 200);
        assert_eq!(config.timeframes, vec![Timeframe::Hour1]);
        assert!(config.exchanges.is_empty());
        assert!(config.close_on_exit);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"account": "main", "symbols": ["ETHUSDT"], "timeframes": ["15m", "4h"]}"#,
        )
        .unwrap();
        assert_eq!(config.account, "main");
        assert_eq!(config.timeframes, vec![Timeframe::Minute15, Timeframe::Hour4]);
        assert_eq!(config.candle_limit, 200);
    }
}

//! Single pipeline run.

use anyhow::{bail, Result};
use std::path::Path;
use trading_workflow::{PipelineRun, StepOutcome};

use crate::cli::commands::configure;
use crate::cli::runtime::{Mode, Runtime};
use crate::cli::RunArgs;

pub async fn run(args: RunArgs, config_path: &Path) -> Result<()> {
    let config = configure(config_path, &args.pipeline)?;
    let mode = if args.paper { Mode::Paper } else { Mode::Live };
    let runtime = Runtime::build(config, mode, args.pipeline.data.as_deref())?;
    runtime.connect().await?;

    let result = runtime.pipeline.run_once().await;
    runtime.shutdown().await;
    let run = result?;

    if args.json {
        let orders: Vec<_> = run.orders().collect();
        let output = serde_json::json!({
            "report": run.report,
            "consensus": run.consensus(),
            "orders": orders,
            "positions": run.positions,
            "artifacts": run.artifacts,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(&run);
    }

    if !run.is_success() {
        let failed: Vec<&str> = run.report.failed().iter().map(|s| s.name.as_str()).collect();
        bail!("pipeline finished with failed steps: {}", failed.join(", "));
    }
    Ok(())
}

/// Human-readable outcome of one run.
pub fn print_summary(run: &PipelineRun) {
    println!("Pipeline run {}", run.report.run_id);
    println!("═══════════════════════════════════════════════════════════");
    for step in &run.report.steps {
        let outcome = match &step.outcome {
            StepOutcome::Succeeded => "ok".to_string(),
            StepOutcome::Failed { error } => format!("FAILED: {}", error),
            StepOutcome::TimedOut { after_ms } => format!("TIMED OUT after {}ms", after_ms),
            StepOutcome::Blocked { by } => format!("blocked by {}", by),
        };
        println!("  {:<24} {:>6}ms  {}", step.name, step.duration_ms, outcome);
    }
    println!();
    println!(
        "Signals: {}   Filtered: {}   Consensus: {}   Exits: {}",
        run.signals.len(),
        run.aggregation.filtered.len(),
        run.consensus().len(),
        run.aggregation.exits.len()
    );
    for consensus in run.consensus() {
        println!(
            "  {} {:?} score {:.2} vs {:.2} ({} strategies)",
            consensus.symbol,
            consensus.signal_type,
            consensus.score,
            consensus.opposing_score,
            consensus.contributing_strategies.len()
        );
    }
    for order in run.orders() {
        println!(
            "  order {} {} {:?} {} {} -> {}",
            order.id, order.exchange, order.side, order.quantity, order.symbol, order.status
        );
    }
    for position in &run.positions {
        println!(
            "  position {} {} @ {} (unrealized {})",
            position.symbol, position.quantity, position.avg_price, position.unrealized_pnl
        );
    }
    for path in &run.artifacts {
        println!("  wrote {}", path.display());
    }
}

//! Paper trading loop.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::cli::commands::configure;
use crate::cli::commands::run_once::print_summary;
use crate::cli::runtime::{Mode, Runtime};
use crate::cli::PaperArgs;

pub async fn run(args: PaperArgs, config_path: &Path) -> Result<()> {
    let config = configure(config_path, &args.pipeline)?;
    let interval = Duration::from_secs(args.interval.unwrap_or(config.app.run_interval_secs).max(1));
    let runtime = Runtime::build(config, Mode::Paper, args.pipeline.data.as_deref())?;
    runtime.connect().await?;

    let prices = match runtime.stream_prices().await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Price stream unavailable, using candle closes: {:#}", e);
            None
        }
    };
    runtime.orders.start_status_sync();
    for id in runtime.exchanges.ids() {
        if let Err(e) = runtime.orders.listen_user_data(&id).await {
            warn!(exchange = %id, "User data stream unavailable: {}", e);
        }
    }

    info!(interval_secs = interval.as_secs(), "Paper trading started, Ctrl-C to stop");
    let mut ticker = tokio::time::interval(interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut completed = 0u64;

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("listening for Ctrl-C")?;
                info!("Interrupt received, shutting down");
                break;
            }
            _ = ticker.tick() => {
                match runtime.pipeline.run_once().await {
                    Ok(run) => print_summary(&run),
                    Err(e) => {
                        error!("Pipeline cannot run: {}", e);
                        break;
                    }
                }
                completed += 1;
                if args.runs.is_some_and(|max| completed >= max) {
                    info!(runs = completed, "Run limit reached");
                    break;
                }
            }
        }
    }

    if let Some(handle) = prices {
        handle.shutdown().await;
    }
    runtime.shutdown().await;

    if let Some(agent) = &runtime.config.pipeline.agent_id {
        let stats = runtime.orders.agent_statistics(agent);
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    info!(runs = completed, "Paper trading stopped");
    Ok(())
}

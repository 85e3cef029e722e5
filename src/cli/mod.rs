//! CLI definitions.

pub mod commands;
pub mod runtime;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "trading-pipeline")]
#[command(author, version, about = "Multi-exchange signal-to-order trading pipeline")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml", env = "TRADING_CONFIG")]
    pub config: PathBuf,

    /// Log level, overrides the configuration file
    #[arg(short, long)]
    pub log_level: Option<LogLevel>,

    /// Enable JSON log format
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline once and print the outcome
    RunOnce(RunArgs),
    /// Run the pipeline on a schedule against simulated exchanges
    Paper(PaperArgs),
    /// List available strategies
    Strategies,
    /// Validate configuration
    ValidateConfig,
}

/// Overrides shared by pipeline commands.
#[derive(clap::Args, Clone, Default)]
pub struct PipelineArgs {
    /// Symbols to trade (comma-separated)
    #[arg(short = 'S', long, value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Timeframes to analyse (comma-separated, e.g. 1h,4h)
    #[arg(short, long, value_delimiter = ',')]
    pub timeframes: Vec<String>,

    /// Account orders are placed for
    #[arg(long)]
    pub account: Option<String>,

    /// Directory of <SYMBOL>_<timeframe>.csv candle files
    #[arg(long)]
    pub data: Option<PathBuf>,

    /// Directory for JSON artifacts
    #[arg(long)]
    pub artifacts: Option<PathBuf>,
}

#[derive(clap::Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Execute against simulated exchanges
    #[arg(long)]
    pub paper: bool,

    /// Print the run as JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct PaperArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Seconds between runs, overrides app.run_interval_secs
    #[arg(long)]
    pub interval: Option<u64>,

    /// Stop after this many runs
    #[arg(long)]
    pub runs: Option<u64>,
}

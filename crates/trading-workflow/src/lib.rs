//! Workflow orchestration.
//!
//! A small DAG engine ([`WorkflowBuilder`], [`Workflow`]) and the
//! [`TradingPipeline`] built on top of it.

pub mod artifacts;
pub mod context;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod steps;

pub use artifacts::ArtifactWriter;
pub use context::WorkflowContext;
pub use engine::{
    StepOptions, StepOutcome, StepReport, Workflow, WorkflowBuilder, WorkflowReport, WorkflowStep,
};
pub use error::{StepError, WorkflowError};
pub use pipeline::{PipelineConfig, PipelineRun, TradingPipeline};
pub use steps::{clean_bars, execute_step_name, ExecutionSummary, MarketSnapshot};

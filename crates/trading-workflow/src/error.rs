use thiserror::Error;
use trading_core::error::{DataError, ExchangeError, StrategyError};
use trading_orders::OrderError;

/// Errors detected while building a workflow graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Step {0} declared twice")]
    DuplicateStep(String),

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Workflow has no steps")]
    Empty,
}

/// Failure of a single workflow step.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("Missing output of step {0}")]
    MissingInput(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

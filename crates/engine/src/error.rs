//! Error taxonomy for the validation engine

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Invalid configuration. Fatal, no partial result.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Too little data for the requested operation. The caller may retry with more.
    #[error("Insufficient data: need at least {required} bars, got {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("Parameter search space is empty")]
    EmptySearchSpace,

    /// A candidate broke one or more constraints. Non-fatal, recorded and excluded from ranking.
    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),

    /// A metric produced NaN/Inf where a finite value was required
    #[error("Simulation diverged: {0}")]
    SimulationDivergence(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Batch cancelled before completion")]
    Cancelled,

    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

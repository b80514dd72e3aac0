//! Error types for the Light Engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the engine
///
/// The variants follow the failure taxonomy the stages act on: validation
/// errors fail fast before any I/O, consistency errors surface only after the
/// local retry budget is spent, and everything else is an I/O or catalog
/// failure that the caller records in the ledger.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Consistency error after {attempts} attempts: {message}")]
    Consistency { attempts: u32, message: String },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Task not found: {execution_name}/{task_id}")]
    TaskNotFound {
        execution_name: String,
        task_id: String,
    },

    #[error("Invalid task transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl EngineError {
    /// Shorthand for a missing required field in a job document
    pub fn missing_field(field: &str) -> Self {
        EngineError::Validation(format!("missing required field '{}'", field))
    }

    /// Whether the orchestrator should treat this as a non-retryable failure
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_) | EngineError::Config(_))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Storage(format!("{:#}", err))
    }
}

//! Common error types for the metrics pipeline

use thiserror::Error;

/// Common result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types shared by the cohort resolver, batch executor and signature cache
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found (unknown cohort tag, unknown metric)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Cohort expression failed grammar validation
    #[error("Invalid cohort expression: {0:?}")]
    InvalidExpression(String),

    /// Request signature is missing a base field.
    ///
    /// This is the soft-reject outcome of the signature cache: callers log it
    /// and carry on with the computed value.
    #[error("Request signature is missing base field '{field}'")]
    InvalidSignature { field: String },

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A batch worker failed as a whole (handle could not be opened, task
    /// panicked, or the worker reported an unrecoverable failure)
    #[error("Worker failed: {0}")]
    WorkerFailed(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the recoverable cache rejection (missing base field)
    pub fn is_soft_reject(&self) -> bool {
        matches!(self, Error::InvalidSignature { .. })
    }

    /// True when the error must abort a whole batch instead of skipping one item
    pub fn is_fatal_for_batch(&self) -> bool {
        matches!(self, Error::WorkerFailed(_))
    }
}

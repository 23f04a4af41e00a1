//! Engine error taxonomy
//!
//! Background-task failures that threaten durability are fatal: the server
//! stops accepting writes and exits for the supervisor to restart. Per-request
//! errors become `Error { message }` responses on the wire.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Durability error: {0}")]
    Durability(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Overloaded: write queue at capacity")]
    Overloaded,

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Incompatible format: {0}")]
    IncompatibleFormat(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

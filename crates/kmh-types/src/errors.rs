use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the kmh harness
#[derive(Error, Debug)]
pub enum KmhError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Checkpoint write failed for {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Instance-loading errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Instance not found: {path}")]
    NotFound { path: PathBuf },

    /// No known (delimiter, decimal) convention produced a usable table.
    #[error("Failed to read {path} with known formats ({attempted})")]
    Unreadable { path: PathBuf, attempted: String },

    #[error("Invalid point matrix: {message}")]
    InvalidPoints { message: String },

    #[error("Invalid distance matrix: {message}")]
    InvalidDistances { message: String },
}

/// Errors raised by a solver strategy.
///
/// Inside a worker every one of these ends up as a `SOLVER_ERROR` row; none
/// of them is allowed to take the worker process down.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("Unknown solver: {name}")]
    UnknownSolver { name: String },

    #[error("Invalid solver input: {message}")]
    InvalidInput { message: String },

    #[error("Solver execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("Solver panicked: {message}")]
    Panicked { message: String },
}

/// Errors of the supervisor <-> worker message channel
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Timed out after {timeout_ms} ms while {operation} {path}")]
    Timeout {
        operation: &'static str,
        path: PathBuf,
        timeout_ms: u128,
    },

    #[error("Unexpected schema version: expected {expected}, got {actual}")]
    SchemaMismatch { expected: String, actual: String },

    #[error("Malformed message in {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Channel IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for kmh operations
pub type KmhResult<T> = Result<T, KmhError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::KmhError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::KmhError::Config(format!($($arg)*))
    };
}

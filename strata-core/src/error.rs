//! Error types for the build core.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for build-core operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for the build core.
#[derive(Error, Debug)]
pub enum StrataError {
    // Entity lookup errors
    #[error("Not found: {resource} {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("Already exists: {resource} {id}")]
    AlreadyExists { resource: &'static str, id: String },

    // State machine errors
    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    // Parse/decode errors
    #[error("Invalid format: {reason}")]
    InvalidFormat { reason: String },

    // Content store errors
    #[error("Storage failure: {reason}")]
    StorageFailure { reason: String },

    #[error("Encoding failed: {reason}")]
    EncodingFailed { reason: String },

    // Operation execution errors
    #[error("Operation {operation} failed: {reason}")]
    ExecutionFailed { operation: String, reason: String },

    #[error("Unsupported operation: {operation}")]
    UnsupportedOperation { operation: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StrataError {
    /// Create an `IoError` bound to the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }

    /// Create a `StorageFailure` from any error type.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::StorageFailure { reason: err.to_string() }
    }
}

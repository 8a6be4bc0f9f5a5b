//! Error types for Pipewright.
//!
//! Library crates use [`PipelineError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Failures raised by external agents are a separate value type,
//! [`StepError`], because they are data to be classified and routed rather
//! than errors to be propagated.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level error type for all Pipewright operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad input, malformed record, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A registry or transition table was queried before `load()` completed.
    #[error("{component} not initialized: call load() first")]
    NotInitialized { component: &'static str },

    /// A stage name is not present in the status registry.
    #[error("unknown status: {0}")]
    UnknownStatus(String),

    /// A stage transition is not in the transition table.
    #[error("{message}")]
    InvalidTransition { from: i64, to: i64, message: String },

    /// A referenced record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a storage error from anything displayable (driver errors, etc.).
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Create a not-found error for the given entity kind.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// A failure raised while processing one item in one pipeline step.
///
/// Carries the message and, when the failure came from an HTTP provider,
/// its status code. The error classifier reads both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    /// A failure carrying an HTTP status code.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }

    /// The agent call exceeded its deadline.
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(format!("agent call timeout after {}s", after.as_secs()))
    }
}

impl From<PipelineError> for StepError {
    fn from(err: PipelineError) -> Self {
        Self::new(err.to_string())
    }
}

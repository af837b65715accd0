//! Core error types.

use robotrpc_protocol::RetVal;
use thiserror::Error;

/// Errors from the host engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown caller: {caller_id}")]
    UnknownCaller { caller_id: String },

    #[error("caller already registered: {caller_id}")]
    CallerExists { caller_id: String },

    #[error("task not found: {task}")]
    TaskNotFound { task: String },

    #[error("invalid datum key: {key:?}")]
    InvalidDatumKey { key: String },

    #[error("invalid reply matcher {id}: {source}")]
    InvalidMatcher {
        id: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Return code a plugin sees for this error.
    pub fn ret_val(&self) -> RetVal {
        match self {
            CoreError::UnknownCaller { .. } => RetVal::Failed,
            CoreError::CallerExists { .. } => RetVal::Failed,
            CoreError::TaskNotFound { .. } => RetVal::TaskNotFound,
            CoreError::InvalidDatumKey { .. } => RetVal::InvalidDatumKey,
            CoreError::InvalidMatcher { .. } => RetVal::MatcherNotFound,
            CoreError::InvalidConfig { .. } => RetVal::Failed,
            CoreError::Json(_) => RetVal::DataFormatError,
        }
    }

    /// Returns an error code suitable for HTTP error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::UnknownCaller { .. } => "UNKNOWN_CALLER",
            CoreError::CallerExists { .. } => "CALLER_EXISTS",
            CoreError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            CoreError::InvalidDatumKey { .. } => "INVALID_DATUM_KEY",
            CoreError::InvalidMatcher { .. } => "BAD_REQUEST",
            CoreError::InvalidConfig { .. } => "BAD_REQUEST",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }
}

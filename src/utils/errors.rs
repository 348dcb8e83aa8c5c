// src/utils/errors.rs
//! Error types for the engine
//!
//! The taxonomy follows how each failure is handled:
//!
//! - **Validation**: a record could not be built; the single record is dropped
//! - **StorageUnavailable**: connect/write/query failed; surfaced to the caller,
//!   retried with backoff for queued writes
//! - **Parameter**: a user supplied query token was rejected; nothing mutated
//!
//! Rollback conflicts are not errors and never appear here.

use thiserror::Error;

/// Engine result alias
pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid record: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Invalid parameter: {0}")]
    Parameter(#[from] ParameterError),

    #[error("Recording failed: {0}")]
    RecordingFailed(String),

    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("World mutation failed: {0}")]
    World(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether a queued write hitting this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StorageUnavailable(_))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

/// A record failed validation at build time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{field}` for {event}")]
    MissingField { field: &'static str, event: String },

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    /// Name of the offending field
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::MissingField { field, .. } => field,
            ValidationError::InvalidField { field, .. } => field,
        }
    }
}

/// A query token could not be turned into conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{token}`: {reason}")]
pub struct ParameterError {
    /// The offending token as the requester typed it
    pub token: String,

    /// Human readable reason
    pub reason: String,
}

impl ParameterError {
    pub fn new(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            reason: reason.into(),
        }
    }
}

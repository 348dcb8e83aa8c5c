// src/utils/mod.rs
//! Shared utilities: configuration snapshot and error types

pub mod config;
pub mod errors;

pub use self::config::{
    EngineConfig, EventToggles, ObservabilityConfig, QueryConfig, RecordingConfig, StorageConfig,
};
pub use self::errors::{EngineError, ParameterError, Result, ValidationError};

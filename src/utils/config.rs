// src/utils/config.rs
//! Engine configuration
//!
//! Loaded with the `config` crate from an optional `worldlog.{toml,yaml,json}`
//! file and `WORLDLOG__*` environment overrides, e.g.
//! `WORLDLOG__STORAGE__ENGINE=document` or `WORLDLOG__QUERY__MAX_RADIUS=50`.
//!
//! A loaded configuration is an immutable snapshot. Reloading builds a new
//! snapshot and a new engine context around it.

use crate::storage::StorageEngine;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file stem (extension resolved by `config`)
pub const DEFAULT_CONFIG_NAME: &str = "worldlog";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "WORLDLOG";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub recording: RecordingConfig,
    pub query: QueryConfig,
    pub events: EventToggles,
    pub observability: ObservabilityConfig,
}

impl EngineConfig {
    /// Load from the default file name and environment
    pub fn load() -> Result<Self> {
        Self::load_from(File::with_name(DEFAULT_CONFIG_NAME).required(false))
    }

    /// Load from an explicit file path plus environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_from(File::from(path.as_ref()).required(true))
    }

    fn load_from<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config: EngineConfig = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        let recording = &self.recording;
        if recording.flush_batch_size == 0 {
            return Err(EngineError::Config(
                "recording.flush_batch_size must be greater than 0".to_string(),
            ));
        }
        if recording.flush_interval_ms == 0 {
            return Err(EngineError::Config(
                "recording.flush_interval_ms must be greater than 0".to_string(),
            ));
        }
        if recording.max_buffer_size < recording.flush_batch_size {
            return Err(EngineError::Config(format!(
                "recording.max_buffer_size ({}) cannot be smaller than flush_batch_size ({})",
                recording.max_buffer_size, recording.flush_batch_size
            )));
        }

        let query = &self.query;
        if query.default_radius > query.max_radius {
            return Err(EngineError::Config(format!(
                "query.default_radius ({}) exceeds query.max_radius ({})",
                query.default_radius, query.max_radius
            )));
        }
        if query.page_size == 0 {
            return Err(EngineError::Config(
                "query.page_size must be greater than 0".to_string(),
            ));
        }
        if query.default_limit > query.max_limit {
            return Err(EngineError::Config(format!(
                "query.default_limit ({}) exceeds query.max_limit ({})",
                query.default_limit, query.max_limit
            )));
        }

        Ok(())
    }
}

/// Storage backend selection and per-backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Active backend
    pub engine: StorageEngine,

    /// SQLite database file (embedded engine); `:memory:` is accepted
    pub embedded_path: PathBuf,

    /// DuckDB database file (relational engine); `:memory:` is accepted
    pub relational_path: PathBuf,

    /// Directory holding document segments (document engine)
    pub document_dir: PathBuf,

    /// zstd level for document segments
    pub compression_level: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: StorageEngine::Embedded,
            embedded_path: PathBuf::from("worldlog.db"),
            relational_path: PathBuf::from("worldlog.duckdb"),
            document_dir: PathBuf::from("worldlog-documents"),
            compression_level: 3,
        }
    }
}

/// Recording queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Flush interval (milliseconds)
    pub flush_interval_ms: u64,

    /// Buffer size that triggers an immediate flush
    pub flush_batch_size: usize,

    /// Hard buffer capacity; enqueues beyond it are dropped
    pub max_buffer_size: usize,

    /// Retries for records a batch write failed to persist
    pub max_retries: u32,

    /// Base backoff between retries (doubled every attempt)
    pub retry_backoff_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1_000,
            flush_batch_size: 500,
            max_buffer_size: 100_000,
            max_retries: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl RecordingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Lookup and rollback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Radius applied when a requester with a location gives none
    pub default_radius: u32,

    /// Radius tokens above this are clamped
    pub max_radius: u32,

    /// Lookup result limit when the session sets none
    pub default_limit: usize,

    /// Hard lookup result limit
    pub max_limit: usize,

    /// Rows fetched per round trip while streaming results
    pub page_size: usize,

    /// Collapse near-duplicate lookup results unless `-nogroup` is given
    pub group_by_default: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_radius: 5,
            max_radius: 100,
            default_limit: 1_000,
            max_limit: 10_000,
            page_size: 500,
            group_by_default: true,
        }
    }
}

/// Which host event categories are recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventToggles {
    pub block_break: bool,
    pub block_place: bool,
    pub entity_death: bool,
    pub sign_change: bool,
    pub player_join: bool,
    pub player_disconnect: bool,
    pub command_execute: bool,
}

impl Default for EventToggles {
    fn default() -> Self {
        Self {
            block_break: true,
            block_place: true,
            entity_death: true,
            sign_change: true,
            player_join: true,
            player_disconnect: true,
            command_execute: true,
        }
    }
}

/// Logging and metrics output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Emit JSON log lines instead of human readable ones
    pub json_logs: bool,

    /// Prometheus listener address, e.g. `0.0.0.0:9184`
    pub metrics_addr: Option<String>,
}

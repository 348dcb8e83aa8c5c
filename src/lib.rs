// src/lib.rs
//! Worldlog Engine Library
//!
//! Records changes to a live world simulation as immutable events, answers
//! lookups over them and rolls them back or restores them on demand.
//!
//! # Architecture
//!
//! - **record**: immutable event records and their builder
//! - **recording**: host ingestion facade and the batching queue manager
//! - **storage**: pluggable backends (embedded, relational, document)
//! - **query**: conditions, query sessions and result grouping
//! - **parameters**: `name:value` token handlers
//! - **rollback**: rollback/restore engine and world executors
//! - **context**: the engine context tying the pieces together
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and errors

pub mod context;
pub mod observability;
pub mod parameters;
pub mod query;
pub mod record;
pub mod recording;
pub mod rollback;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use context::EngineContext;
pub use query::{Condition, Flag, QuerySession, Requester};
pub use record::{EventType, Record, RecordBuilder};
pub use recording::{Recorder, RecordingQueueManager};
pub use rollback::{RollbackEngine, RollbackSummary, WorldExecutor, WorldMutator};
pub use storage::{StorageAdapter, StorageEngine};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

// src/storage/mod.rs
//! Pluggable record storage
//!
//! Every backend implements [`StorageAdapter`]; the rest of the engine only
//! sees `Arc<dyn StorageAdapter>`. Which backend is active is decided once,
//! from configuration, by [`connect`].
//!
//! - **Embedded**: SQLite file through `rusqlite`
//! - **Relational**: DuckDB through `duckdb`
//! - **Document**: zstd-compressed JSON segments queried with filter documents
//!
//! # Query results
//!
//! ```text
//! query(session) ──► RecordStream (lazy)
//!                      ├─ page 1: fetch page_size rows after cursor None
//!                      ├─ page 2: fetch page_size rows after (ts, id) of last row
//!                      └─ ... until a short page
//! ```
//!
//! Ordering is by timestamp then id, descending unless the session asks for
//! ascending order.

pub mod document;
pub mod embedded;
pub mod relational;
mod sql;
#[cfg(test)]
pub(crate) mod testing;

pub use document::DocumentAdapter;
pub use embedded::EmbeddedAdapter;
pub use relational::RelationalAdapter;

use crate::query::QuerySession;
use crate::record::{Record, RecordId};
use crate::utils::config::StorageConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Lazily fetched, ordered query results
pub type RecordStream = BoxStream<'static, Result<Record>>;

/// Available storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngine {
    Embedded,
    Relational,
    Document,
}

impl fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageEngine::Embedded => "embedded",
            StorageEngine::Relational => "relational",
            StorageEngine::Document => "document",
        };
        f.write_str(name)
    }
}

/// A record the backend could not persist
#[derive(Debug, Clone)]
pub struct FailedRecord {
    pub record: Record,
    pub reason: String,
}

/// Result of one batch write; partial success is normal
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    /// Persisted records, carrying their new ids
    pub persisted: Vec<Record>,

    /// Records to retry
    pub failed: Vec<FailedRecord>,
}

impl WriteOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Storage backend contract
#[async_trait]
pub trait StorageAdapter: Send + Sync + 'static {
    /// Which engine this adapter implements
    fn engine(&self) -> StorageEngine;

    /// Open and validate connectivity.
    ///
    /// Fails with [`EngineError::StorageUnavailable`].
    async fn connect(&self) -> Result<()>;

    /// Persist a batch, assigning ids to the records that made it
    async fn write_batch(&self, records: Vec<Record>) -> Result<WriteOutcome>;

    /// Execute the session's condition set
    async fn query(&self, session: &QuerySession) -> Result<RecordStream>;

    /// Mark records as rolled back; returns how many rows changed
    async fn apply_rollback(&self, ids: &[RecordId]) -> Result<usize>;

    /// Clear the rolled-back mark; returns how many rows changed
    async fn apply_restore(&self, ids: &[RecordId]) -> Result<usize>;

    /// Release connections
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Build and connect the adapter selected by configuration
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn StorageAdapter>> {
    let adapter: Arc<dyn StorageAdapter> = match config.engine {
        StorageEngine::Embedded => Arc::new(EmbeddedAdapter::new(config.embedded_path.clone())),
        StorageEngine::Relational => {
            Arc::new(RelationalAdapter::new(config.relational_path.clone()))
        }
        StorageEngine::Document => Arc::new(DocumentAdapter::new(
            config.document_dir.clone(),
            config.compression_level,
        )),
    };

    adapter.connect().await?;
    info!("Storage adapter connected: {}", adapter.engine());

    Ok(adapter)
}

/// Position just past the last row of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub timestamp_micros: i64,
    pub id: u64,
}

impl Cursor {
    pub fn after(record: &Record) -> Self {
        let (timestamp_micros, id) = record.sort_key();
        Self {
            timestamp_micros,
            id,
        }
    }
}

/// Fetches one page of at most `page_size` records after a cursor
pub(crate) type PageFetcher =
    Arc<dyn Fn(Option<Cursor>, usize) -> BoxFuture<'static, Result<Vec<Record>>> + Send + Sync>;

enum PageState {
    Next(Option<Cursor>),
    Done,
}

/// Turn a page fetcher into a lazy record stream
pub(crate) fn paged_stream(
    fetch: PageFetcher,
    page_size: usize,
    limit: Option<usize>,
) -> RecordStream {
    let page_size = page_size.max(1);

    let pages = stream::try_unfold(PageState::Next(None), move |state| {
        let fetch = Arc::clone(&fetch);
        async move {
            let cursor = match state {
                PageState::Next(cursor) => cursor,
                PageState::Done => return Ok(None),
            };

            let page = fetch(cursor, page_size).await?;
            if page.is_empty() {
                return Ok(None);
            }

            let next = if page.len() < page_size {
                PageState::Done
            } else {
                PageState::Next(page.last().map(Cursor::after))
            };
            Ok::<_, EngineError>(Some((page, next)))
        }
    });

    let records = pages
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<Record, EngineError>)))
        .try_flatten();

    match limit {
        Some(limit) => records.take(limit).boxed(),
        None => records.boxed(),
    }
}

pub(crate) fn storage_error(context: &str, err: impl fmt::Display) -> EngineError {
    EngineError::StorageUnavailable(format!("{}: {}", context, err))
}

pub(crate) fn not_connected(engine: StorageEngine) -> EngineError {
    EngineError::StorageUnavailable(format!("{} storage is not connected", engine))
}

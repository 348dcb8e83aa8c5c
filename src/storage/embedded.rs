// src/storage/embedded.rs
//! Embedded backend: a single SQLite file
//!
//! The connection lives behind `Arc<Mutex<..>>` and every statement runs on
//! the blocking pool, so producers and the flush worker never stall the async
//! runtime on disk I/O.

use crate::query::QuerySession;
use crate::record::{Record, RecordId};
use crate::storage::sql::{self, SqlValue};
use crate::storage::{
    not_connected, paged_stream, storage_error, Cursor, FailedRecord, PageFetcher, RecordStream,
    StorageAdapter, StorageEngine, WriteOutcome,
};
use crate::utils::errors::Result;
use async_trait::async_trait;
use futures::FutureExt;
use rusqlite::{params_from_iter, Connection};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type SharedConnection = Arc<Mutex<Option<Connection>>>;

/// SQLite-backed record storage
pub struct EmbeddedAdapter {
    path: PathBuf,
    db: SharedConnection,
    next_id: Arc<AtomicU64>,
}

impl EmbeddedAdapter {
    /// Create an adapter for the database at `path`; nothing is opened yet
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Run `f` against the open connection on the blocking pool
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        run_blocking(Arc::clone(&self.db), f).await
    }
}

async fn run_blocking<T, F>(db: SharedConnection, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = db.blocking_lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| not_connected(StorageEngine::Embedded))?;
        f(conn)
    })
    .await
    .map_err(|e| storage_error("SQLite task failed", e))?
}

fn to_sqlite(value: SqlValue) -> rusqlite::types::Value {
    match value {
        SqlValue::Null => rusqlite::types::Value::Null,
        SqlValue::Integer(value) => rusqlite::types::Value::Integer(value),
        SqlValue::Real(value) => rusqlite::types::Value::Real(value),
        SqlValue::Text(value) => rusqlite::types::Value::Text(value),
    }
}

fn sqlite_params(values: Vec<SqlValue>) -> impl rusqlite::Params {
    params_from_iter(values.into_iter().map(to_sqlite))
}

fn fetch_page(
    conn: &Connection,
    sql: &str,
    params: Vec<SqlValue>,
) -> Result<Vec<Record>> {
    let mut stmt = conn
        .prepare_cached(sql)
        .map_err(|e| storage_error("Query preparation failed", e))?;

    let rows = stmt
        .query_map(sqlite_params(params), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(2)?))
        })
        .map_err(|e| storage_error("Query execution failed", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| storage_error("Result collection failed", e))?;

    rows.into_iter()
        .map(|(id, body)| sql::decode_row(id, &body))
        .collect()
}

#[async_trait]
impl StorageAdapter for EmbeddedAdapter {
    fn engine(&self) -> StorageEngine {
        StorageEngine::Embedded
    }

    async fn connect(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error("Failed to create directory", e))?;
        }

        let path = self.path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<(Connection, i64)> {
            let conn = Connection::open(&path)
                .map_err(|e| storage_error("Failed to open database", e))?;
            conn.execute_batch(sql::SCHEMA)
                .map_err(|e| storage_error("Schema creation failed", e))?;
            let max_id: i64 = conn
                .query_row(sql::MAX_ID, [], |row| row.get(0))
                .map_err(|e| storage_error("Failed to read id sequence", e))?;
            Ok((conn, max_id))
        })
        .await
        .map_err(|e| storage_error("SQLite task failed", e))?;

        let (conn, max_id) = conn?;
        self.next_id.store(max_id as u64 + 1, Ordering::SeqCst);
        *self.db.lock().await = Some(conn);

        info!("Embedded storage opened at {:?}", self.path);
        Ok(())
    }

    async fn write_batch(&self, records: Vec<Record>) -> Result<WriteOutcome> {
        let next_id = Arc::clone(&self.next_id);

        self.with_connection(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| storage_error("Failed to begin transaction", e))?;
            let mut outcome = WriteOutcome::default();

            for record in records {
                let id = RecordId(next_id.fetch_add(1, Ordering::SeqCst));
                let inserted = sql::insert_params(id, &record).and_then(|params| {
                    tx.execute(sql::INSERT, sqlite_params(params))
                        .map_err(|e| storage_error("Insert failed", e))
                });

                match inserted {
                    Ok(_) => outcome.persisted.push(record.into_persisted(id)),
                    Err(e) => {
                        warn!("Record not persisted: {}", e);
                        outcome.failed.push(FailedRecord {
                            record,
                            reason: e.to_string(),
                        });
                    }
                }
            }

            tx.commit()
                .map_err(|e| storage_error("Failed to commit batch", e))?;

            debug!(
                "Wrote {} records ({} failed)",
                outcome.persisted.len(),
                outcome.failed.len()
            );
            Ok(outcome)
        })
        .await
    }

    async fn query(&self, session: &QuerySession) -> Result<RecordStream> {
        let filter = Arc::new(sql::translate(session));
        let sort = session.sort();
        let db = Arc::clone(&self.db);

        let fetch: PageFetcher = Arc::new(move |cursor: Option<Cursor>, page_size: usize| {
            let (sql, params) = sql::page_query(&filter, sort, cursor, page_size);
            let db = Arc::clone(&db);
            run_blocking(db, move |conn| fetch_page(conn, &sql, params)).boxed()
        });

        Ok(paged_stream(fetch, session.page_size(), session.limit()))
    }

    async fn apply_rollback(&self, ids: &[RecordId]) -> Result<usize> {
        self.mark_reversed(ids, true).await
    }

    async fn apply_restore(&self, ids: &[RecordId]) -> Result<usize> {
        self.mark_reversed(ids, false).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.db.lock().await.take() {
            conn.close()
                .map_err(|(_, e)| storage_error("Failed to close database", e))?;
        }
        Ok(())
    }
}

impl EmbeddedAdapter {
    async fn mark_reversed(&self, ids: &[RecordId], reversed: bool) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let updates = sql::reversed_updates(ids, reversed);

        self.with_connection(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| storage_error("Failed to begin transaction", e))?;
            let mut changed = 0;
            for (sql, params) in updates {
                changed += tx
                    .execute(&sql, sqlite_params(params))
                    .map_err(|e| storage_error("Update failed", e))?;
            }
            tx.commit()
                .map_err(|e| storage_error("Failed to commit update", e))?;
            Ok(changed)
        })
        .await
    }
}

// src/storage/relational.rs
//! Relational backend: DuckDB
//!
//! Shares its table layout and condition translation with the embedded
//! backend. DuckDB aborts a whole transaction on the first failing
//! statement, so batch inserts run in autocommit mode to keep partial
//! success per record.

use crate::query::QuerySession;
use crate::record::{Record, RecordId};
use crate::storage::sql::{self, SqlValue};
use crate::storage::{
    not_connected, paged_stream, storage_error, Cursor, FailedRecord, PageFetcher, RecordStream,
    StorageAdapter, StorageEngine, WriteOutcome,
};
use crate::utils::errors::Result;
use async_trait::async_trait;
use duckdb::{params_from_iter, Connection};
use futures::FutureExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type SharedConnection = Arc<Mutex<Option<Connection>>>;

/// DuckDB-backed record storage
pub struct RelationalAdapter {
    path: PathBuf,
    db: SharedConnection,
    next_id: Arc<AtomicU64>,
}

impl RelationalAdapter {
    /// Create an adapter for the database at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

async fn run_blocking<T, F>(db: SharedConnection, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let guard = db.blocking_lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| not_connected(StorageEngine::Relational))?;
        f(conn)
    })
    .await
    .map_err(|e| storage_error("DuckDB task failed", e))?
}

fn to_duckdb(value: SqlValue) -> duckdb::types::Value {
    match value {
        SqlValue::Null => duckdb::types::Value::Null,
        SqlValue::Integer(value) => duckdb::types::Value::BigInt(value),
        SqlValue::Real(value) => duckdb::types::Value::Double(value),
        SqlValue::Text(value) => duckdb::types::Value::Text(value),
    }
}

fn duckdb_params(values: Vec<SqlValue>) -> impl duckdb::Params {
    params_from_iter(values.into_iter().map(to_duckdb))
}

fn fetch_page(conn: &Connection, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Record>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| storage_error("Query preparation failed", e))?;

    let rows = stmt
        .query_map(duckdb_params(params), |row| {
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
impl StorageAdapter for RelationalAdapter {
    fn engine(&self) -> StorageEngine {
        StorageEngine::Relational
    }

    async fn connect(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error("Failed to create directory", e))?;
        }

        let path = self.path.clone();
        let opened = tokio::task::spawn_blocking(move || -> Result<(Connection, i64)> {
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
        .map_err(|e| storage_error("DuckDB task failed", e))?;

        let (conn, max_id) = opened?;
        self.next_id.store(max_id as u64 + 1, Ordering::SeqCst);
        *self.db.lock().await = Some(conn);

        info!("Relational storage opened at {:?}", self.path);
        Ok(())
    }

    async fn write_batch(&self, records: Vec<Record>) -> Result<WriteOutcome> {
        let next_id = Arc::clone(&self.next_id);

        run_blocking(Arc::clone(&self.db), move |conn| {
            let mut stmt = conn
                .prepare(sql::INSERT)
                .map_err(|e| storage_error("Insert preparation failed", e))?;
            let mut outcome = WriteOutcome::default();

            for record in records {
                let id = RecordId(next_id.fetch_add(1, Ordering::SeqCst));
                let inserted = sql::insert_params(id, &record).and_then(|params| {
                    stmt.execute(duckdb_params(params))
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
            run_blocking(Arc::clone(&db), move |conn| fetch_page(conn, &sql, params)).boxed()
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

impl RelationalAdapter {
    async fn mark_reversed(&self, ids: &[RecordId], reversed: bool) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let updates = sql::reversed_updates(ids, reversed);

        run_blocking(Arc::clone(&self.db), move |conn| {
            let mut changed = 0;
            for (sql, params) in updates {
                changed += conn
                    .execute(&sql, duckdb_params(params))
                    .map_err(|e| storage_error("Update failed", e))?;
            }
            Ok(changed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Condition, Requester};
    use crate::record::{BlockState, EventType, Location, PlayerRef, RecordBuilder};
    use chrono::{Duration, Utc};
    use futures::TryStreamExt;
    use tempfile::tempdir;

    fn break_at(x: i64, block: &str, offset_secs: i64) -> Record {
        RecordBuilder::new(EventType::BlockBreak)
            .location(Location::block("world", x, 64, 0))
            .player(PlayerRef::new("uuid-alice", "alice"))
            .block_break(BlockState::new(block))
            .build_at(Utc::now() - Duration::seconds(offset_secs))
            .unwrap()
    }

    async fn open(dir: &tempfile::TempDir) -> RelationalAdapter {
        let adapter = RelationalAdapter::new(dir.path().join("worldlog.duckdb"));
        adapter.connect().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_write_and_query_by_target() {
        let dir = tempdir().unwrap();
        let adapter = open(&dir).await;
        let outcome = adapter
            .write_batch(vec![
                break_at(0, "minecraft:stone", 3),
                break_at(1, "minecraft:oak_log", 2),
                break_at(2, "minecraft:stone", 1),
            ])
            .await
            .unwrap();
        assert_eq!(outcome.persisted.len(), 3);

        let mut session = QuerySession::new(Requester::console());
        session.add_condition(Condition::target("stone"));
        let records: Vec<Record> = adapter.query(&session).await.unwrap().try_collect().await.unwrap();

        assert_eq!(records.len(), 2);
        assert!(records[0].timestamp() >= records[1].timestamp());
    }

    #[tokio::test]
    async fn test_radius_is_inclusive() {
        let dir = tempdir().unwrap();
        let adapter = open(&dir).await;
        let edge = RecordBuilder::new(EventType::BlockBreak)
            .location(Location::new("world", 3.0, 64.0, 4.0))
            .block_break(BlockState::new("stone"))
            .build()
            .unwrap();
        let beyond = RecordBuilder::new(EventType::BlockBreak)
            .location(Location::new("world", 3.0, 64.0, 4.000_001))
            .block_break(BlockState::new("stone"))
            .build()
            .unwrap();
        adapter.write_batch(vec![edge, beyond]).await.unwrap();

        let mut session = QuerySession::new(Requester::console());
        session.add_condition(Condition::within(Location::new("world", 0.0, 64.0, 0.0), 5.0));
        let records: Vec<Record> = adapter.query(&session).await.unwrap().try_collect().await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].location().unwrap().z, 4.0);
    }

    #[tokio::test]
    async fn test_rollback_marks() {
        let dir = tempdir().unwrap();
        let adapter = open(&dir).await;
        let outcome = adapter.write_batch(vec![break_at(0, "stone", 0)]).await.unwrap();
        let id = outcome.persisted[0].id().unwrap();

        assert_eq!(adapter.apply_rollback(&[id]).await.unwrap(), 1);

        let mut session = QuerySession::new(Requester::console());
        session.add_condition(Condition::Reversed(false));
        let records: Vec<Record> = adapter.query(&session).await.unwrap().try_collect().await.unwrap();
        assert!(records.is_empty());
    }
}

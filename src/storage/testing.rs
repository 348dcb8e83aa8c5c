// src/storage/testing.rs
//! In-memory adapter with scriptable failures, for unit tests

use crate::query::{QuerySession, SortOrder};
use crate::record::{Record, RecordId};
use crate::storage::{FailedRecord, RecordStream, StorageAdapter, StorageEngine, WriteOutcome};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Decides whether a record fails on its nth attempt (1-based)
pub(crate) type FailurePolicy = Box<dyn Fn(&Record, usize) -> bool + Send + Sync>;

pub(crate) struct ScriptedAdapter {
    rows: Mutex<Vec<(Record, bool)>>,
    next_id: AtomicU64,
    policy: Option<FailurePolicy>,
    attempts: Mutex<HashMap<String, usize>>,
    write_sizes: Mutex<Vec<usize>>,
    gate: Option<Arc<Semaphore>>,
    unavailable: AtomicBool,
    sorts: Mutex<Vec<SortOrder>>,
    readable: Option<usize>,
}

/// Player name, used to identify records in assertions
pub(crate) fn key(record: &Record) -> String {
    record
        .player()
        .map(|player| player.name.clone())
        .unwrap_or_default()
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            policy: None,
            attempts: Mutex::new(HashMap::new()),
            write_sizes: Mutex::new(Vec::new()),
            gate: None,
            unavailable: AtomicBool::new(false),
            sorts: Mutex::new(Vec::new()),
            readable: None,
        }
    }

    pub fn failing(policy: impl Fn(&Record, usize) -> bool + Send + Sync + 'static) -> Self {
        Self {
            policy: Some(Box::new(policy)),
            ..Self::new()
        }
    }

    /// Every write waits for a permit on `gate`
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    /// Query streams yield `count` records, then fail
    pub fn breaking_reads_after(count: usize) -> Self {
        Self {
            readable: Some(count),
            ..Self::new()
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn persisted(&self) -> Vec<Record> {
        self.rows.lock().iter().map(|(record, _)| record.clone()).collect()
    }

    pub fn is_reversed(&self, id: RecordId) -> bool {
        self.rows
            .lock()
            .iter()
            .any(|(record, reversed)| record.id() == Some(id) && *reversed)
    }

    pub fn write_sizes(&self) -> Vec<usize> {
        self.write_sizes.lock().clone()
    }

    /// Sort order of every query so far
    pub fn queried_sorts(&self) -> Vec<SortOrder> {
        self.sorts.lock().clone()
    }

    pub fn attempts(&self, name: &str) -> usize {
        self.attempts.lock().get(name).copied().unwrap_or(0)
    }

    fn mark(&self, ids: &[RecordId], reversed: bool) -> usize {
        let mut rows = self.rows.lock();
        let mut changed = 0;
        for (record, flag) in rows.iter_mut() {
            if record.id().map_or(false, |id| ids.contains(&id)) {
                *flag = reversed;
                changed += 1;
            }
        }
        changed
    }
}

#[async_trait]
impl StorageAdapter for ScriptedAdapter {
    fn engine(&self) -> StorageEngine {
        StorageEngine::Embedded
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn write_batch(&self, records: Vec<Record>) -> Result<WriteOutcome> {
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| EngineError::StorageUnavailable(e.to_string()))?;
        }
        self.write_sizes.lock().push(records.len());
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::StorageUnavailable("scripted outage".to_string()));
        }

        let mut outcome = WriteOutcome::default();
        for record in records {
            let attempt = {
                let mut attempts = self.attempts.lock();
                let count = attempts.entry(key(&record)).or_insert(0);
                *count += 1;
                *count
            };

            let fails = self
                .policy
                .as_ref()
                .map_or(false, |policy| policy(&record, attempt));
            if fails {
                outcome.failed.push(FailedRecord {
                    record,
                    reason: "scripted failure".to_string(),
                });
                continue;
            }

            let id = RecordId(self.next_id.fetch_add(1, Ordering::SeqCst));
            let record = record.into_persisted(id);
            self.rows.lock().push((record.clone(), false));
            outcome.persisted.push(record);
        }
        Ok(outcome)
    }

    async fn query(&self, session: &QuerySession) -> Result<RecordStream> {
        self.sorts.lock().push(session.sort());
        let mut hits: Vec<Record> = self
            .rows
            .lock()
            .iter()
            .filter(|(record, reversed)| session.matches(record, *reversed))
            .map(|(record, _)| record.clone())
            .collect();
        hits.sort_by_key(Record::sort_key);
        if session.sort() == SortOrder::Descending {
            hits.reverse();
        }
        if let Some(limit) = session.limit() {
            hits.truncate(limit);
        }
        let mut items: Vec<Result<Record>> = hits.into_iter().map(Ok).collect();
        if let Some(count) = self.readable {
            if count < items.len() {
                items.truncate(count);
                items.push(Err(EngineError::StorageUnavailable("scripted read failure".to_string())));
            }
        }
        Ok(stream::iter(items).boxed())
    }

    async fn apply_rollback(&self, ids: &[RecordId]) -> Result<usize> {
        Ok(self.mark(ids, true))
    }

    async fn apply_restore(&self, ids: &[RecordId]) -> Result<usize> {
        Ok(self.mark(ids, false))
    }
}

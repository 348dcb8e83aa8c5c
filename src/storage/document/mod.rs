// src/storage/document/mod.rs
//! Document backend: compressed JSON segments on disk
//!
//! # Layout
//!
//! ```text
//! <document_dir>/
//! ├─ segments/
//! │  ├─ 000001.json.zst   one write batch per segment
//! │  └─ 000002.json.zst
//! └─ state.json           ids currently rolled back
//! ```
//!
//! Segments are append-only. The collection is loaded into memory on
//! connect and queries evaluate a translated filter document against it.

pub mod codec;
pub mod filter;

pub use codec::SegmentCodec;

use crate::query::{QuerySession, SortOrder};
use crate::record::{normalize_player_needle, Record, RecordId};
use crate::storage::{
    not_connected, paged_stream, storage_error, Cursor, FailedRecord, PageFetcher, RecordStream,
    StorageAdapter, StorageEngine, WriteOutcome,
};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SEGMENTS_DIR: &str = "segments";
const SEGMENT_SUFFIX: &str = ".json.zst";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct DocumentState {
    reversed: BTreeSet<u64>,
}

struct StoredDocument {
    id: u64,
    ts: i64,
    document: Value,
    record: Record,
}

#[derive(Default)]
struct Collection {
    documents: Vec<StoredDocument>,
    index: HashMap<u64, usize>,
    state: DocumentState,
    next_id: u64,
    next_segment: u64,
}

impl Collection {
    fn insert(&mut self, stored: StoredDocument) {
        self.next_id = self.next_id.max(stored.id + 1);
        self.index.insert(stored.id, self.documents.len());
        self.documents.push(stored);
    }

    fn set_reversed(&mut self, id: u64, reversed: bool) -> bool {
        let Some(&position) = self.index.get(&id) else {
            return false;
        };
        self.documents[position].document["reversed"] = Value::Bool(reversed);
        if reversed {
            self.state.reversed.insert(id);
        } else {
            self.state.reversed.remove(&id);
        }
        true
    }

    fn page(
        &self,
        filter: &Value,
        sort: SortOrder,
        cursor: Option<Cursor>,
        page_size: usize,
    ) -> Vec<Record> {
        let mut hits: Vec<&StoredDocument> = self
            .documents
            .iter()
            .filter(|stored| match cursor {
                None => true,
                Some(cursor) => {
                    let key = (stored.ts, stored.id);
                    let bound = (cursor.timestamp_micros, cursor.id);
                    match sort {
                        SortOrder::Descending => key < bound,
                        SortOrder::Ascending => key > bound,
                    }
                }
            })
            .filter(|stored| filter::matches(filter, &stored.document))
            .collect();

        hits.sort_by_key(|stored| (stored.ts, stored.id));
        if sort == SortOrder::Descending {
            hits.reverse();
        }

        hits.into_iter()
            .take(page_size)
            .map(|stored| stored.record.clone())
            .collect()
    }
}

/// Build the stored document for a record
fn to_document(id: u64, record: &Record) -> Result<Value> {
    let location = record.location();
    let player = record.player();
    let target = record.target();

    Ok(json!({
        "_id": id,
        "event": record.event().as_str(),
        "ts": record.timestamp_micros(),
        "world": location.map(|location| location.world.clone()),
        "loc": location.map(|location| vec![location.x, location.y, location.z]),
        "player_id": player.map(|player| normalize_player_needle(&player.id)),
        "player_name": player.map(|player| normalize_player_needle(&player.name)),
        "target_id": target.map(|target| target.id.clone()),
        "target_local": target.map(|target| target.local_id().to_string()),
        "session": record.session().map(|session| session.to_string()),
        "reversed": false,
        "record": serde_json::to_value(record)?,
    }))
}

fn from_document(document: Value) -> Result<StoredDocument> {
    let id = document
        .get("_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| storage_error("Corrupt document", "missing _id"))?;
    let body = document
        .get("record")
        .cloned()
        .ok_or_else(|| storage_error("Corrupt document", "missing record"))?;
    let record = serde_json::from_value::<Record>(body)?.into_persisted(RecordId(id));

    Ok(StoredDocument {
        id,
        ts: record.timestamp_micros(),
        document,
        record,
    })
}

fn segment_number(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Document-store record storage
pub struct DocumentAdapter {
    dir: PathBuf,
    codec: SegmentCodec,
    collection: Arc<RwLock<Option<Collection>>>,
    write_lock: Mutex<()>,
}

impl DocumentAdapter {
    /// Create an adapter rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>, compression_level: i32) -> Self {
        Self {
            dir: dir.into(),
            codec: SegmentCodec::new(compression_level),
            collection: Arc::new(RwLock::new(None)),
            write_lock: Mutex::new(()),
        }
    }

    fn segments_dir(&self) -> PathBuf {
        self.dir.join(SEGMENTS_DIR)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.collection.read().is_some() {
            Ok(())
        } else {
            Err(not_connected(StorageEngine::Document))
        }
    }

    async fn load(&self) -> Result<Collection> {
        let segments_dir = self.segments_dir();
        fs::create_dir_all(&segments_dir)
            .await
            .map_err(|e| storage_error("Failed to create segments directory", e))?;

        let mut segments = Vec::new();
        let mut entries = fs::read_dir(&segments_dir)
            .await
            .map_err(|e| storage_error("Failed to list segments", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_error("Failed to list segments", e))?
        {
            let path = entry.path();
            match segment_number(&path) {
                Some(number) => segments.push((number, path)),
                None => debug!("Ignoring {:?}", path),
            }
        }
        segments.sort();

        let mut collection = Collection {
            next_id: 1,
            next_segment: segments.last().map(|(number, _)| number + 1).unwrap_or(1),
            ..Default::default()
        };

        for (_, path) in &segments {
            let data = fs::read(path)
                .await
                .map_err(|e| storage_error("Failed to read segment", e))?;
            for document in self.codec.decode(&data)? {
                collection.insert(from_document(document)?);
            }
        }

        let state_path = self.dir.join(STATE_FILE);
        if fs::try_exists(&state_path).await.unwrap_or(false) {
            let raw = fs::read(&state_path)
                .await
                .map_err(|e| storage_error("Failed to read state", e))?;
            let state: DocumentState = serde_json::from_slice(&raw)?;
            for id in state.reversed {
                if !collection.set_reversed(id, true) {
                    warn!("Rolled back id {} has no document", id);
                }
            }
        }

        info!(
            "Loaded {} documents from {} segments",
            collection.documents.len(),
            segments.len()
        );
        Ok(collection)
    }

    async fn persist_state(&self, state: Vec<u8>) -> Result<()> {
        let path = self.dir.join(STATE_FILE);
        let tmp = self.dir.join(format!("{}.tmp", STATE_FILE));
        fs::write(&tmp, state)
            .await
            .map_err(|e| storage_error("Failed to write state", e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_error("Failed to replace state", e))?;
        Ok(())
    }

    async fn mark_reversed(&self, ids: &[RecordId], reversed: bool) -> Result<usize> {
        self.ensure_connected()?;
        if ids.is_empty() {
            return Ok(0);
        }
        let _write = self.write_lock.lock().await;

        // Memory only changes once the new state is on disk
        let (changed, state) = {
            let guard = self.collection.read();
            let collection = guard
                .as_ref()
                .ok_or_else(|| not_connected(StorageEngine::Document))?;
            let changed: Vec<u64> = ids
                .iter()
                .map(|id| id.0)
                .filter(|id| collection.index.contains_key(id))
                .collect();
            let mut next = DocumentState {
                reversed: collection.state.reversed.clone(),
            };
            for id in &changed {
                if reversed {
                    next.reversed.insert(*id);
                } else {
                    next.reversed.remove(id);
                }
            }
            (changed, serde_json::to_vec(&next)?)
        };

        self.persist_state(state).await?;

        let mut guard = self.collection.write();
        let collection = guard
            .as_mut()
            .ok_or_else(|| not_connected(StorageEngine::Document))?;
        for id in &changed {
            collection.set_reversed(*id, reversed);
        }
        Ok(changed.len())
    }
}

#[async_trait]
impl StorageAdapter for DocumentAdapter {
    fn engine(&self) -> StorageEngine {
        StorageEngine::Document
    }

    async fn connect(&self) -> Result<()> {
        let collection = self.load().await?;
        *self.collection.write() = Some(collection);
        info!("Document storage opened at {:?}", self.dir);
        Ok(())
    }

    async fn write_batch(&self, records: Vec<Record>) -> Result<WriteOutcome> {
        self.ensure_connected()?;
        let _write = self.write_lock.lock().await;

        let (mut next_id, segment) = {
            let guard = self.collection.read();
            let collection = guard
                .as_ref()
                .ok_or_else(|| not_connected(StorageEngine::Document))?;
            (collection.next_id, collection.next_segment)
        };

        let mut outcome = WriteOutcome::default();
        let mut documents = Vec::with_capacity(records.len());
        let mut staged = Vec::with_capacity(records.len());

        for record in records {
            match to_document(next_id, &record) {
                Ok(document) => {
                    documents.push(document);
                    staged.push(record.into_persisted(RecordId(next_id)));
                    next_id += 1;
                }
                Err(e) => {
                    warn!("Record not persisted: {}", e);
                    outcome.failed.push(FailedRecord {
                        record,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if documents.is_empty() {
            return Ok(outcome);
        }

        let encoded = self.codec.encode(&documents)?;
        let path = self
            .segments_dir()
            .join(format!("{:06}{}", segment, SEGMENT_SUFFIX));
        fs::write(&path, &encoded)
            .await
            .map_err(|e| EngineError::StorageUnavailable(format!("Failed to write segment: {}", e)))?;

        {
            let mut guard = self.collection.write();
            let collection = guard
                .as_mut()
                .ok_or_else(|| not_connected(StorageEngine::Document))?;
            for (document, record) in documents.into_iter().zip(&staged) {
                let id = record.id().map(|id| id.0).unwrap_or_default();
                collection.insert(StoredDocument {
                    id,
                    ts: record.timestamp_micros(),
                    document,
                    record: record.clone(),
                });
            }
            collection.next_segment = segment + 1;
        }

        debug!("Wrote segment {} ({} documents)", segment, staged.len());
        outcome.persisted = staged;
        Ok(outcome)
    }

    async fn query(&self, session: &QuerySession) -> Result<RecordStream> {
        self.ensure_connected()?;
        let filter = Arc::new(filter::translate(session));
        let sort = session.sort();
        let collection = Arc::clone(&self.collection);

        let fetch: PageFetcher = Arc::new(move |cursor: Option<Cursor>, page_size: usize| {
            let page = collection
                .read()
                .as_ref()
                .map(|collection| collection.page(&filter, sort, cursor, page_size))
                .ok_or_else(|| not_connected(StorageEngine::Document));
            futures::future::ready(page).boxed()
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
        let _write = self.write_lock.lock().await;
        self.collection.write().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Condition, Requester};
    use crate::record::{EventType, Location, PlayerRef, RecordBuilder, SessionId};
    use futures::TryStreamExt;
    use tempfile::tempdir;

    fn sign(x: i64, player: &str) -> Record {
        RecordBuilder::new(EventType::SignEdit)
            .location(Location::block("world", x, 64, 0))
            .player(PlayerRef::new(format!("uuid-{}", player), player))
            .target("minecraft:oak_sign")
            .sign_edit(vec![String::new()], vec!["hello".to_string()])
            .build()
            .unwrap()
    }

    async fn collect(adapter: &DocumentAdapter, session: &QuerySession) -> Vec<Record> {
        adapter.query(session).await.unwrap().try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_segments_survive_reopen() {
        let dir = tempdir().unwrap();
        let adapter = DocumentAdapter::new(dir.path(), 3);
        adapter.connect().await.unwrap();
        adapter.write_batch(vec![sign(0, "alice"), sign(1, "bob")]).await.unwrap();
        adapter.write_batch(vec![sign(2, "alice")]).await.unwrap();
        adapter.close().await.unwrap();

        let reopened = DocumentAdapter::new(dir.path(), 3);
        reopened.connect().await.unwrap();

        let mut session = QuerySession::new(Requester::console());
        session.add_condition(Condition::player("alice"));
        assert_eq!(collect(&reopened, &session).await.len(), 2);

        let outcome = reopened.write_batch(vec![sign(3, "carol")]).await.unwrap();
        assert_eq!(outcome.persisted[0].id(), Some(RecordId(4)));
    }

    #[tokio::test]
    async fn test_reversed_state_persists() {
        let dir = tempdir().unwrap();
        let adapter = DocumentAdapter::new(dir.path(), 3);
        adapter.connect().await.unwrap();
        let outcome = adapter.write_batch(vec![sign(0, "alice")]).await.unwrap();
        let id = outcome.persisted[0].id().unwrap();

        assert_eq!(adapter.apply_rollback(&[id, RecordId(99)]).await.unwrap(), 1);
        adapter.close().await.unwrap();

        let reopened = DocumentAdapter::new(dir.path(), 3);
        reopened.connect().await.unwrap();
        let mut session = QuerySession::new(Requester::console());
        session.add_condition(Condition::Reversed(true));
        assert_eq!(collect(&reopened, &session).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_state_write_leaves_records_unmarked() {
        let dir = tempdir().unwrap();
        let adapter = DocumentAdapter::new(dir.path(), 3);
        adapter.connect().await.unwrap();
        let outcome = adapter.write_batch(vec![sign(0, "alice")]).await.unwrap();
        let id = outcome.persisted[0].id().unwrap();

        // A directory where the temporary state file goes makes the write fail
        let blocker = dir.path().join(format!("{}.tmp", STATE_FILE));
        std::fs::create_dir(&blocker).unwrap();
        assert!(adapter.apply_rollback(&[id]).await.is_err());

        let mut rolled_back = QuerySession::new(Requester::console());
        rolled_back.add_condition(Condition::Reversed(true));
        assert!(collect(&adapter, &rolled_back).await.is_empty());

        std::fs::remove_dir(&blocker).unwrap();
        assert_eq!(adapter.apply_rollback(&[id]).await.unwrap(), 1);
        assert_eq!(collect(&adapter, &rolled_back).await.len(), 1);
    }

    #[tokio::test]
    async fn test_session_and_paging() {
        let dir = tempdir().unwrap();
        let adapter = DocumentAdapter::new(dir.path(), 3);
        adapter.connect().await.unwrap();

        let operation = SessionId::new();
        let batch: Vec<Record> = (0..12)
            .map(|x| {
                RecordBuilder::new(EventType::BlockBreak)
                    .location(Location::block("world", x, 64, 0))
                    .block_break(crate::record::BlockState::new("tnt"))
                    .session(operation)
                    .build()
                    .unwrap()
            })
            .collect();
        adapter.write_batch(batch).await.unwrap();
        adapter.write_batch(vec![sign(0, "alice")]).await.unwrap();

        let mut session = QuerySession::new(Requester::console());
        session.add_condition(Condition::Session(operation));
        session.set_page_size(5);
        let records = collect(&adapter, &session).await;

        assert_eq!(records.len(), 12);
        assert!(records
            .windows(2)
            .all(|pair| pair[0].sort_key() > pair[1].sort_key()));
    }

    #[tokio::test]
    async fn test_unconnected_adapter_is_unavailable() {
        let dir = tempdir().unwrap();
        let adapter = DocumentAdapter::new(dir.path(), 3);
        let err = adapter.write_batch(vec![sign(0, "alice")]).await.unwrap_err();
        assert!(err.is_retryable());
    }
}

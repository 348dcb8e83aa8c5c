// src/rollback/mod.rs
//! Rollback and restore
//!
//! A rollback undoes every matching change that has not been rolled back
//! yet, newest first. A restore replays rolled back changes, oldest first.
//!
//! # Architecture
//!
//! ```text
//! QuerySession (+ Reversed(false|true))
//!       ↓
//! StorageAdapter::query (desc | asc, ties by id), streamed page by page
//!       ↓
//! ActionTable ──► WorldAction ──► WorldExecutor (one at a time)
//!       ↓                               ↓
//! RollbackSummary ◄── Applied | Conflict | failed
//!       ↓
//! StorageAdapter::apply_rollback | apply_restore (applied ids only)
//! ```
//!
//! A conflict (the world no longer looks the way the record left it) skips
//! that one action; the batch always continues. Records are consumed as the
//! adapter pages them in, so a large rollback never holds the whole result.

pub mod actions;
pub mod world;

pub use actions::{ActionFn, ActionTable, WorldAction};
pub use world::{
    apply_action, simulation_channel, ApplyOutcome, DirectExecutor, MemoryWorld,
    SimulationDispatcher, SimulationQueue, WorldExecutor, WorldMutator,
};

use crate::query::{Condition, Flag, QuerySession, SortOrder};
use crate::record::{EventType, RecordId};
use crate::storage::StorageAdapter;
use crate::utils::errors::{EngineError, Result};
use futures::TryStreamExt;
use metrics::counter;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which way records are replayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Rollback,
    Restore,
}

impl Direction {
    /// Reversed state of the records this direction acts on
    fn source_state(&self) -> bool {
        matches!(self, Direction::Restore)
    }

    /// Newest first for rollback, oldest first for restore
    pub fn sort_order(&self) -> SortOrder {
        match self {
            Direction::Rollback => SortOrder::Descending,
            Direction::Restore => SortOrder::Ascending,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rollback => f.write_str("rollback"),
            Direction::Restore => f.write_str("restore"),
        }
    }
}

/// An action whose precondition did not hold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictDetail {
    pub record: Option<RecordId>,
    pub event: EventType,
    pub reason: String,
}

/// An action computed during a dry run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedAction {
    pub record: Option<RecordId>,
    pub action: WorldAction,
}

/// Outcome of one rollback or restore
#[derive(Debug, Clone, Serialize)]
pub struct RollbackSummary {
    pub direction: Direction,

    /// Records returned by the query
    pub matched: usize,

    /// Actions applied to the world
    pub applied: usize,

    /// Actions skipped because the world changed since
    pub conflicts: usize,

    /// Records with no world effect (joins, commands)
    pub skipped: usize,

    /// Records with no usable action or whose execution errored
    pub failed: usize,

    /// Actions computed by a dry run
    pub planned: usize,

    pub dry_run: bool,
    pub cancelled: bool,
    pub nothing_to_do: bool,

    /// Applied records whose reversed state could not be stored
    pub unmarked: usize,

    /// Storage error that stopped reading records after changes were applied
    pub interrupted: Option<String>,

    pub elapsed: Duration,
    pub conflict_details: Vec<ConflictDetail>,
    pub preview: Vec<PlannedAction>,
}

impl RollbackSummary {
    fn new(direction: Direction, dry_run: bool) -> Self {
        Self {
            direction,
            matched: 0,
            applied: 0,
            conflicts: 0,
            skipped: 0,
            failed: 0,
            planned: 0,
            dry_run,
            cancelled: false,
            nothing_to_do: false,
            unmarked: 0,
            interrupted: None,
            elapsed: Duration::ZERO,
            conflict_details: Vec::new(),
            preview: Vec::new(),
        }
    }
}

/// Restrict every condition group to records in `reversed` state.
///
/// Groups that already constrain the reversed state are left alone. Empty
/// groups stay empty; when no group has conditions a fresh one is added.
pub fn constrain_reversed(session: &mut QuerySession, reversed: bool) {
    if session.effective_groups().next().is_none() {
        session.new_group().add(Condition::Reversed(reversed));
        return;
    }

    for group in session.groups_mut() {
        if !group.is_empty() && !group.constrains_reversed() {
            group.add(Condition::Reversed(reversed));
        }
    }
}

/// Runs rollbacks and restores against one storage adapter and world
#[derive(Clone)]
pub struct RollbackEngine {
    adapter: Arc<dyn StorageAdapter>,
    executor: Arc<dyn WorldExecutor>,
    actions: Arc<ActionTable>,
}

impl RollbackEngine {
    pub fn new(adapter: Arc<dyn StorageAdapter>, executor: Arc<dyn WorldExecutor>) -> Self {
        Self {
            adapter,
            executor,
            actions: Arc::new(ActionTable::default()),
        }
    }

    /// Same executor and actions against another backend
    pub fn with_adapter(&self, adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            ..self.clone()
        }
    }

    /// Replace the default action table
    pub fn with_actions(mut self, actions: ActionTable) -> Self {
        self.actions = Arc::new(actions);
        self
    }

    pub async fn rollback(
        &self,
        session: QuerySession,
        cancel: &CancellationToken,
    ) -> Result<RollbackSummary> {
        self.run(Direction::Rollback, session, cancel).await
    }

    pub async fn restore(
        &self,
        session: QuerySession,
        cancel: &CancellationToken,
    ) -> Result<RollbackSummary> {
        self.run(Direction::Restore, session, cancel).await
    }

    /// Run on a tokio task; the handle can cancel it between records
    pub fn spawn(&self, direction: Direction, session: QuerySession) -> RollbackHandle {
        let cancel = CancellationToken::new();
        let engine = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { engine.run(direction, session, &token).await });
        RollbackHandle { cancel, task }
    }

    /// Query in replay order and apply as records stream in.
    ///
    /// Storage errors abort the run while the world is still untouched. Once
    /// a change has been applied, a read error stops the run, the applied
    /// records are still marked and the error lands in `interrupted`.
    /// Per-record problems are counted and the batch continues.
    pub async fn run(
        &self,
        direction: Direction,
        mut session: QuerySession,
        cancel: &CancellationToken,
    ) -> Result<RollbackSummary> {
        let started = Instant::now();
        let dry_run = session.has_flag(Flag::DryRun);
        let mut summary = RollbackSummary::new(direction, dry_run);

        constrain_reversed(&mut session, direction.source_state());
        session.set_sort(direction.sort_order());
        let mut records = self.adapter.query(&session).await?;

        let mut applied_ids = Vec::new();
        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let record = match records.try_next().await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) if applied_ids.is_empty() => return Err(e),
                Err(e) => {
                    error!(
                        "{} stopped reading records after {} changes: {}",
                        direction,
                        applied_ids.len(),
                        e
                    );
                    summary.interrupted = Some(e.to_string());
                    break;
                }
            };
            summary.matched += 1;

            let action = match self.actions.action_for(direction, &record) {
                Ok(action) => action,
                Err(e) => {
                    warn!("{}: no action for record {:?}: {}", direction, record.id(), e);
                    summary.failed += 1;
                    continue;
                }
            };

            if action.is_nothing() {
                summary.skipped += 1;
                continue;
            }

            if dry_run {
                summary.planned += 1;
                summary.preview.push(PlannedAction {
                    record: record.id(),
                    action,
                });
                continue;
            }

            match self.executor.execute(action).await {
                Ok(ApplyOutcome::Applied) => {
                    summary.applied += 1;
                    if let Some(id) = record.id() {
                        applied_ids.push(id);
                    }
                }
                Ok(ApplyOutcome::Conflict(reason)) => {
                    debug!("{} conflict on record {:?}: {}", direction, record.id(), reason);
                    summary.conflicts += 1;
                    summary.conflict_details.push(ConflictDetail {
                        record: record.id(),
                        event: record.event(),
                        reason,
                    });
                }
                Err(e) => {
                    warn!("{} failed on record {:?}: {}", direction, record.id(), e);
                    summary.failed += 1;
                }
            }
        }

        if summary.matched == 0 && !summary.cancelled {
            summary.nothing_to_do = true;
            summary.elapsed = started.elapsed();
            debug!("{}: nothing to do", direction);
            return Ok(summary);
        }

        if !applied_ids.is_empty() {
            if let Err(e) = self.mark(direction, &applied_ids).await {
                error!(
                    "{} applied {} changes but could not record it: {}",
                    direction,
                    applied_ids.len(),
                    e
                );
                summary.unmarked = applied_ids.len();
            }
        }

        counter!("worldlog_rollback_applied_total", "direction" => direction.to_string())
            .increment(summary.applied as u64);
        counter!("worldlog_rollback_conflicts_total", "direction" => direction.to_string())
            .increment(summary.conflicts as u64);

        summary.elapsed = started.elapsed();
        info!(
            "{} finished: matched={} applied={} conflicts={} skipped={} failed={} planned={} cancelled={} in {:?}",
            direction,
            summary.matched,
            summary.applied,
            summary.conflicts,
            summary.skipped,
            summary.failed,
            summary.planned,
            summary.cancelled,
            summary.elapsed
        );
        Ok(summary)
    }

    async fn mark(&self, direction: Direction, ids: &[RecordId]) -> Result<usize> {
        match direction {
            Direction::Rollback => self.adapter.apply_rollback(ids).await,
            Direction::Restore => self.adapter.apply_restore(ids).await,
        }
    }
}

/// A rollback or restore running on its own task
pub struct RollbackHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<RollbackSummary>>,
}

impl RollbackHandle {
    /// Stop after the record currently being applied
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<RollbackSummary> {
        self.task
            .await
            .map_err(|e| EngineError::World(format!("rollback task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Requester;
    use crate::record::{BlockState, Location, PlayerRef, Record, RecordBuilder};
    use crate::storage::testing::ScriptedAdapter;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use parking_lot::Mutex;
    use proptest::prelude::*;

    fn alice() -> PlayerRef {
        PlayerRef::new("uuid-alice", "alice")
    }

    fn spot(x: i64) -> Location {
        Location::block("world", x, 64, 0)
    }

    fn session() -> QuerySession {
        let mut session = QuerySession::new(Requester::console());
        session.add_condition(Condition::player("alice"));
        session
    }

    async fn persist(adapter: &ScriptedAdapter, records: Vec<Record>) {
        let outcome = adapter.write_batch(records).await.unwrap();
        assert!(outcome.is_complete());
    }

    fn broke(x: i64, block: &str, offset_ms: i64) -> Record {
        RecordBuilder::new(EventType::BlockBreak)
            .location(spot(x))
            .player(alice())
            .block_break(BlockState::new(block))
            .build_at(Utc::now() + ChronoDuration::milliseconds(offset_ms))
            .unwrap()
    }

    fn placed(x: i64, block: &str, replaced: Option<&str>, offset_ms: i64) -> Record {
        RecordBuilder::new(EventType::BlockPlace)
            .location(spot(x))
            .player(alice())
            .block_place(BlockState::new(block), replaced.map(BlockState::new))
            .build_at(Utc::now() + ChronoDuration::milliseconds(offset_ms))
            .unwrap()
    }

    fn engine(adapter: Arc<ScriptedAdapter>, world: MemoryWorld) -> (RollbackEngine, Arc<Mutex<MemoryWorld>>) {
        let executor = DirectExecutor::new(world);
        let handle = executor.world();
        (RollbackEngine::new(adapter, Arc::new(executor)), handle)
    }

    /// Remembers the order actions arrive in
    #[derive(Default)]
    struct Journal {
        seen: Mutex<Vec<WorldAction>>,
    }

    #[async_trait]
    impl WorldExecutor for Journal {
        async fn execute(&self, action: WorldAction) -> Result<ApplyOutcome> {
            self.seen.lock().push(action);
            Ok(ApplyOutcome::Applied)
        }
    }

    fn replacement_types(seen: &[WorldAction]) -> Vec<String> {
        seen.iter()
            .filter_map(|action| match action {
                WorldAction::SetBlock { replacement, .. } => {
                    Some(replacement.as_ref().map_or("air".to_string(), |b| b.block_type.clone()))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_break_then_place_rolls_back_to_original() {
        let adapter = Arc::new(ScriptedAdapter::new());
        persist(&adapter, vec![broke(0, "stone", 0), placed(0, "dirt", None, 10)]).await;
        let world = MemoryWorld::new().with_block(&spot(0), BlockState::new("dirt"));
        let (engine, world) = engine(Arc::clone(&adapter), world);

        let summary = engine.rollback(session(), &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.matched, 2);
        assert_eq!(summary.applied, 2);
        assert_eq!(summary.conflicts, 0);
        assert_eq!(world.lock().block(&spot(0)), Some(BlockState::new("stone")));
        assert!(adapter.is_reversed(RecordId(1)) && adapter.is_reversed(RecordId(2)));

        // Rolled back records are not matched a second time
        let again = engine.rollback(session(), &CancellationToken::new()).await.unwrap();
        assert!(again.nothing_to_do);
    }

    #[tokio::test]
    async fn test_restore_replays_oldest_first() {
        let adapter = Arc::new(ScriptedAdapter::new());
        persist(&adapter, vec![broke(0, "stone", 0), placed(0, "dirt", None, 10)]).await;
        let world = MemoryWorld::new().with_block(&spot(0), BlockState::new("dirt"));
        let (engine, world) = engine(Arc::clone(&adapter), world);
        let cancel = CancellationToken::new();

        engine.rollback(session(), &cancel).await.unwrap();
        let summary = engine.restore(session(), &cancel).await.unwrap();

        assert_eq!(summary.applied, 2);
        assert_eq!(world.lock().block(&spot(0)), Some(BlockState::new("dirt")));
        assert!(!adapter.is_reversed(RecordId(1)));
    }

    #[tokio::test]
    async fn test_single_conflict_does_not_abort() {
        let adapter = Arc::new(ScriptedAdapter::new());
        persist(
            &adapter,
            vec![broke(0, "stone", 0), broke(1, "stone", 10), broke(2, "stone", 20)],
        )
        .await;
        // Someone built on x=1 after the break
        let world = MemoryWorld::new().with_block(&spot(1), BlockState::new("glass"));
        let (engine, world) = engine(Arc::clone(&adapter), world);

        let summary = engine.rollback(session(), &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.applied, 2);
        assert_eq!(summary.conflicts, 1);
        assert_eq!(summary.conflict_details[0].record, Some(RecordId(2)));
        assert_eq!(world.lock().block(&spot(1)), Some(BlockState::new("glass")));
        assert!(!adapter.is_reversed(RecordId(2)));
        assert!(adapter.is_reversed(RecordId(3)));
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let adapter = Arc::new(ScriptedAdapter::new());
        persist(&adapter, vec![broke(0, "stone", 0)]).await;
        let (engine, world) = engine(Arc::clone(&adapter), MemoryWorld::new());

        let mut preview = session();
        preview.add_flag(Flag::DryRun);
        let summary = engine.rollback(preview, &CancellationToken::new()).await.unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.planned, 1);
        assert_eq!(summary.applied, 0);
        assert_eq!(summary.preview.len(), 1);
        assert_eq!(world.lock().block_count(), 0);
        assert!(!adapter.is_reversed(RecordId(1)));
    }

    #[tokio::test]
    async fn test_non_world_events_are_skipped() {
        let adapter = Arc::new(ScriptedAdapter::new());
        let join = RecordBuilder::new(EventType::PlayerJoin)
            .player(alice())
            .build()
            .unwrap();
        persist(&adapter, vec![join, broke(0, "stone", 10)]).await;
        let (engine, _) = engine(Arc::clone(&adapter), MemoryWorld::new());

        let summary = engine.rollback(session(), &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.matched, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.applied, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_applies_nothing() {
        let adapter = Arc::new(ScriptedAdapter::new());
        persist(&adapter, vec![broke(0, "stone", 0), broke(1, "stone", 10)]).await;
        let (engine, world) = engine(Arc::clone(&adapter), MemoryWorld::new());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = engine.rollback(session(), &cancel).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.applied, 0);
        assert_eq!(world.lock().block_count(), 0);
    }

    /// Applies through a `DirectExecutor`, cancelling once the first change lands
    struct CancelAfterFirst {
        inner: DirectExecutor<MemoryWorld>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl WorldExecutor for CancelAfterFirst {
        async fn execute(&self, action: WorldAction) -> Result<ApplyOutcome> {
            let outcome = self.inner.execute(action).await?;
            if outcome == ApplyOutcome::Applied {
                self.cancel.cancel();
            }
            Ok(outcome)
        }
    }

    #[tokio::test]
    async fn test_cancel_between_records_keeps_applied_changes() {
        let adapter = Arc::new(ScriptedAdapter::new());
        persist(
            &adapter,
            vec![broke(0, "stone", 0), broke(1, "stone", 10), broke(2, "stone", 20)],
        )
        .await;

        let cancel = CancellationToken::new();
        let inner = DirectExecutor::new(MemoryWorld::new());
        let world = inner.world();
        let executor = CancelAfterFirst {
            inner,
            cancel: cancel.clone(),
        };
        let engine = RollbackEngine::new(adapter.clone(), Arc::new(executor));

        let summary = engine.rollback(session(), &cancel).await.unwrap();
        assert!(summary.cancelled);
        assert!(!summary.nothing_to_do);
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.applied, 1);

        // Newest break undone and marked; the older two untouched
        assert!(adapter.is_reversed(RecordId(3)));
        assert!(!adapter.is_reversed(RecordId(2)));
        assert!(!adapter.is_reversed(RecordId(1)));
        let world = world.lock();
        assert_eq!(world.block(&spot(2)), Some(BlockState::new("stone")));
        assert_eq!(world.block_count(), 1);
    }

    #[tokio::test]
    async fn test_query_order_follows_direction() {
        let adapter = Arc::new(ScriptedAdapter::new());
        persist(&adapter, vec![broke(0, "stone", 0)]).await;
        let (engine, _) = engine(Arc::clone(&adapter), MemoryWorld::new());
        let cancel = CancellationToken::new();

        engine.rollback(session(), &cancel).await.unwrap();
        engine.restore(session(), &cancel).await.unwrap();

        assert_eq!(
            adapter.queried_sorts(),
            vec![SortOrder::Descending, SortOrder::Ascending]
        );
    }

    #[tokio::test]
    async fn test_read_failure_after_changes_still_marks_them() {
        let adapter = Arc::new(ScriptedAdapter::breaking_reads_after(1));
        persist(&adapter, vec![broke(0, "stone", 0), broke(1, "stone", 10)]).await;
        let (engine, world) = engine(Arc::clone(&adapter), MemoryWorld::new());

        let summary = engine.rollback(session(), &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.applied, 1);
        assert!(summary.interrupted.is_some());
        assert!(adapter.is_reversed(RecordId(2)));
        assert!(!adapter.is_reversed(RecordId(1)));
        assert_eq!(world.lock().block_count(), 1);
    }

    #[tokio::test]
    async fn test_read_failure_before_changes_is_an_error() {
        let adapter = Arc::new(ScriptedAdapter::breaking_reads_after(0));
        persist(&adapter, vec![broke(0, "stone", 0)]).await;
        let (engine, world) = engine(Arc::clone(&adapter), MemoryWorld::new());

        let err = engine
            .rollback(session(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StorageUnavailable(_)));
        assert_eq!(world.lock().block_count(), 0);
    }

    #[tokio::test]
    async fn test_spawned_handle_reports_summary() {
        let adapter = Arc::new(ScriptedAdapter::new());
        persist(&adapter, vec![broke(0, "stone", 0)]).await;
        let (engine, _) = engine(Arc::clone(&adapter), MemoryWorld::new());

        let handle = engine.spawn(Direction::Rollback, session());
        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.applied, 1);
    }

    #[test]
    fn test_constrain_reversed_respects_explicit_state() {
        let mut explicit = session();
        explicit.add_condition(Condition::Reversed(true));
        explicit.new_group().add(Condition::player("bob"));
        // Trailing empty group from a dangling `or`
        explicit.new_group();
        constrain_reversed(&mut explicit, false);

        let groups = explicit.groups();
        assert_eq!(groups[0].conditions().last(), Some(&Condition::Reversed(true)));
        assert_eq!(groups[1].conditions().last(), Some(&Condition::Reversed(false)));
        assert!(groups[2].is_empty());

        let mut bare = QuerySession::new(Requester::console());
        constrain_reversed(&mut bare, true);
        assert_eq!(bare.groups()[0].conditions(), &[Condition::Reversed(true)]);
    }

    proptest! {
        #[test]
        fn prop_rollback_is_newest_first(offsets in proptest::collection::vec(0i64..1_000, 1..20)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let adapter = Arc::new(ScriptedAdapter::new());
                let base = Utc::now();
                let records = offsets
                    .iter()
                    .enumerate()
                    .map(|(i, offset)| {
                        RecordBuilder::new(EventType::BlockBreak)
                            .location(spot(i as i64))
                            .player(alice())
                            .block_break(BlockState::new(format!("block_{}", i)))
                            .build_at(base + ChronoDuration::milliseconds(*offset))
                            .unwrap()
                    })
                    .collect();
                persist(&adapter, records).await;

                let journal = Arc::new(Journal::default());
                let engine = RollbackEngine::new(adapter.clone(), journal.clone());
                engine.rollback(session(), &CancellationToken::new()).await.unwrap();

                let mut expected: Vec<(i64, usize)> = offsets
                    .iter()
                    .enumerate()
                    .map(|(i, offset)| (*offset, i))
                    .collect();
                // Ties go to the later id, which was assigned in insertion order
                expected.sort();
                expected.reverse();
                let expected: Vec<String> = expected
                    .into_iter()
                    .map(|(_, i)| format!("block_{}", i))
                    .collect();

                assert_eq!(replacement_types(&journal.seen.lock()), expected);
            });
        }
    }
}

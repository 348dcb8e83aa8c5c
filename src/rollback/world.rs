// src/rollback/world.rs
//! World mutation seams
//!
//! The host world is only safe to touch from its simulation thread. The
//! engine talks to a [`WorldExecutor`]; the [`SimulationDispatcher`]
//! implementation ships each action as a job to the simulation thread,
//! which drains jobs once per tick:
//!
//! ```text
//! RollbackEngine ──execute()──► SimulationDispatcher
//!       ▲                              │ crossbeam-channel
//!       │ oneshot reply                ▼
//!       └──────────────── SimulationQueue::run_pending(&mut world)
//!                          (precondition check + mutation, one job)
//! ```

use crate::record::{BlockKey, BlockState, EntitySnapshot, Location};
use crate::rollback::WorldAction;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;

/// Synchronous host world API
pub trait WorldMutator {
    /// Current block at `location`; `None` is air
    fn block(&self, location: &Location) -> Option<BlockState>;

    fn set_block(&mut self, location: &Location, state: Option<BlockState>) -> Result<()>;

    fn has_entity(&self, location: &Location, entity: &EntitySnapshot) -> bool;

    fn spawn_entity(&mut self, location: &Location, entity: &EntitySnapshot) -> Result<()>;

    fn remove_entity(&mut self, location: &Location, entity: &EntitySnapshot) -> Result<()>;

    /// Lines of the sign at `location`, if there is one
    fn sign_text(&self, location: &Location) -> Option<Vec<String>>;

    fn set_sign_text(&mut self, location: &Location, lines: &[String]) -> Result<()>;
}

/// Result of executing one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,

    /// Precondition did not hold; the world was left untouched
    Conflict(String),
}

/// What the rollback engine calls to mutate the world
#[async_trait]
pub trait WorldExecutor: Send + Sync {
    async fn execute(&self, action: WorldAction) -> Result<ApplyOutcome>;
}

fn describe(state: &Option<BlockState>) -> &str {
    state.as_ref().map_or("air", |state| state.block_type.as_str())
}

fn same_block(current: &Option<BlockState>, expected: &Option<BlockState>) -> bool {
    match (current, expected) {
        (None, None) => true,
        (Some(current), Some(expected)) => current.same_type(expected),
        _ => false,
    }
}

/// Check the action's precondition and mutate the world if it holds
pub fn apply_action<W: WorldMutator + ?Sized>(
    world: &mut W,
    action: &WorldAction,
) -> Result<ApplyOutcome> {
    match action {
        WorldAction::SetBlock {
            location,
            expected,
            replacement,
        } => {
            let current = world.block(location);
            if !same_block(&current, expected) {
                return Ok(ApplyOutcome::Conflict(format!(
                    "expected {} at {}, found {}",
                    describe(expected),
                    location,
                    describe(&current)
                )));
            }
            world.set_block(location, replacement.clone())?;
        }
        WorldAction::SpawnEntity { location, entity } => {
            if world.has_entity(location, entity) {
                return Ok(ApplyOutcome::Conflict(format!(
                    "{} already present at {}",
                    entity.entity_type, location
                )));
            }
            world.spawn_entity(location, entity)?;
        }
        WorldAction::RemoveEntity { location, entity } => {
            if !world.has_entity(location, entity) {
                return Ok(ApplyOutcome::Conflict(format!(
                    "{} not present at {}",
                    entity.entity_type, location
                )));
            }
            world.remove_entity(location, entity)?;
        }
        WorldAction::SetSignText {
            location,
            expected,
            lines,
        } => match world.sign_text(location) {
            None => {
                return Ok(ApplyOutcome::Conflict(format!("no sign at {}", location)));
            }
            Some(current) if current != *expected => {
                return Ok(ApplyOutcome::Conflict(format!(
                    "sign at {} was edited since",
                    location
                )));
            }
            Some(_) => world.set_sign_text(location, lines)?,
        },
        WorldAction::Nothing => {}
    }
    Ok(ApplyOutcome::Applied)
}

struct Job {
    action: WorldAction,
    reply: oneshot::Sender<Result<ApplyOutcome>>,
}

/// Create a connected dispatcher/queue pair
pub fn simulation_channel() -> (SimulationDispatcher, SimulationQueue) {
    let (jobs, pending) = crossbeam_channel::unbounded();
    (SimulationDispatcher { jobs }, SimulationQueue { pending })
}

/// Executor that marshals actions onto the simulation thread
#[derive(Clone)]
pub struct SimulationDispatcher {
    jobs: Sender<Job>,
}

#[async_trait]
impl WorldExecutor for SimulationDispatcher {
    async fn execute(&self, action: WorldAction) -> Result<ApplyOutcome> {
        let (reply, response) = oneshot::channel();
        self.jobs
            .send(Job { action, reply })
            .map_err(|_| EngineError::World("simulation queue is closed".to_string()))?;

        response
            .await
            .map_err(|_| EngineError::World("simulation thread dropped the job".to_string()))?
    }
}

/// Simulation-thread end of the channel
pub struct SimulationQueue {
    pending: Receiver<Job>,
}

impl SimulationQueue {
    /// Run every queued job against `world`. Returns the number of jobs run.
    pub fn run_pending<W: WorldMutator + ?Sized>(&self, world: &mut W) -> usize {
        self.run_at_most(world, usize::MAX)
    }

    /// Like [`run_pending`](Self::run_pending) with a per-tick job budget
    pub fn run_at_most<W: WorldMutator + ?Sized>(&self, world: &mut W, budget: usize) -> usize {
        let mut ran = 0;
        while ran < budget {
            let job = match self.pending.try_recv() {
                Ok(job) => job,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };

            let outcome = apply_action(world, &job.action);
            trace!("Simulation job {} -> {:?}", job.action, outcome);
            // Requester may have given up waiting
            let _ = job.reply.send(outcome);
            ran += 1;
        }
        ran
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Executor for worlds that are safe to touch from any thread
pub struct DirectExecutor<W> {
    world: Arc<Mutex<W>>,
}

impl<W: WorldMutator + Send> DirectExecutor<W> {
    pub fn new(world: W) -> Self {
        Self::shared(Arc::new(Mutex::new(world)))
    }

    pub fn shared(world: Arc<Mutex<W>>) -> Self {
        Self { world }
    }

    pub fn world(&self) -> Arc<Mutex<W>> {
        Arc::clone(&self.world)
    }
}

#[async_trait]
impl<W: WorldMutator + Send> WorldExecutor for DirectExecutor<W> {
    async fn execute(&self, action: WorldAction) -> Result<ApplyOutcome> {
        let mut world = self.world.lock();
        apply_action(&mut *world, &action)
    }
}

/// In-memory world
#[derive(Debug, Clone, Default)]
pub struct MemoryWorld {
    blocks: HashMap<BlockKey, BlockState>,
    entities: HashMap<BlockKey, Vec<EntitySnapshot>>,
    signs: HashMap<BlockKey, Vec<String>>,
}

fn same_entity(a: &EntitySnapshot, b: &EntitySnapshot) -> bool {
    match (&a.uuid, &b.uuid) {
        (Some(a), Some(b)) => a == b,
        _ => a.entity_type == b.entity_type,
    }
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style block placement
    pub fn with_block(mut self, location: &Location, state: BlockState) -> Self {
        self.blocks.insert(location.block_key(), state);
        self
    }

    pub fn with_sign(mut self, location: &Location, lines: Vec<String>) -> Self {
        self.signs.insert(location.block_key(), lines);
        self
    }

    pub fn entities_at(&self, location: &Location) -> &[EntitySnapshot] {
        self.entities
            .get(&location.block_key())
            .map_or(&[], Vec::as_slice)
    }

    /// Number of non-air blocks
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl WorldMutator for MemoryWorld {
    fn block(&self, location: &Location) -> Option<BlockState> {
        self.blocks.get(&location.block_key()).cloned()
    }

    fn set_block(&mut self, location: &Location, state: Option<BlockState>) -> Result<()> {
        let key = location.block_key();
        match state {
            Some(state) => {
                self.blocks.insert(key, state);
            }
            None => {
                self.blocks.remove(&key);
                self.signs.remove(&key);
            }
        }
        Ok(())
    }

    fn has_entity(&self, location: &Location, entity: &EntitySnapshot) -> bool {
        self.entities_at(location)
            .iter()
            .any(|present| same_entity(present, entity))
    }

    fn spawn_entity(&mut self, location: &Location, entity: &EntitySnapshot) -> Result<()> {
        self.entities
            .entry(location.block_key())
            .or_default()
            .push(entity.clone());
        Ok(())
    }

    fn remove_entity(&mut self, location: &Location, entity: &EntitySnapshot) -> Result<()> {
        let key = location.block_key();
        if let Some(present) = self.entities.get_mut(&key) {
            if let Some(index) = present.iter().position(|e| same_entity(e, entity)) {
                present.remove(index);
            }
            if present.is_empty() {
                self.entities.remove(&key);
            }
        }
        Ok(())
    }

    fn sign_text(&self, location: &Location) -> Option<Vec<String>> {
        self.signs.get(&location.block_key()).cloned()
    }

    fn set_sign_text(&mut self, location: &Location, lines: &[String]) -> Result<()> {
        self.signs.insert(location.block_key(), lines.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn spot() -> Location {
        Location::block("world", 10, 64, 10)
    }

    fn set(expected: Option<&str>, replacement: Option<&str>) -> WorldAction {
        WorldAction::SetBlock {
            location: spot(),
            expected: expected.map(BlockState::new),
            replacement: replacement.map(BlockState::new),
        }
    }

    #[test]
    fn test_set_block_checks_type_only() {
        let mut world = MemoryWorld::new()
            .with_block(&spot(), BlockState::new("oak_stairs").with_property("facing", "north"));

        let outcome = apply_action(&mut world, &set(Some("oak_stairs"), Some("stone"))).unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(world.block(&spot()), Some(BlockState::new("stone")));
    }

    #[test]
    fn test_conflict_leaves_world_untouched() {
        let mut world = MemoryWorld::new().with_block(&spot(), BlockState::new("dirt"));

        let outcome = apply_action(&mut world, &set(None, Some("stone"))).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Conflict(reason) if reason.contains("found dirt")));
        assert_eq!(world.block(&spot()), Some(BlockState::new("dirt")));
    }

    #[test]
    fn test_entity_presence_preconditions() {
        let mut world = MemoryWorld::new();
        let cow = EntitySnapshot::new("minecraft:cow").with_uuid("c-1");
        let spawn = WorldAction::SpawnEntity {
            location: spot(),
            entity: cow.clone(),
        };
        let remove = WorldAction::RemoveEntity {
            location: spot(),
            entity: cow,
        };

        assert_eq!(apply_action(&mut world, &spawn).unwrap(), ApplyOutcome::Applied);
        assert!(matches!(apply_action(&mut world, &spawn).unwrap(), ApplyOutcome::Conflict(_)));
        assert_eq!(apply_action(&mut world, &remove).unwrap(), ApplyOutcome::Applied);
        assert!(world.entities_at(&spot()).is_empty());
        assert!(matches!(apply_action(&mut world, &remove).unwrap(), ApplyOutcome::Conflict(_)));
    }

    #[test]
    fn test_sign_text_must_match() {
        let mut world = MemoryWorld::new().with_sign(&spot(), vec!["hello".into()]);
        let rewrite = |expected: &str| WorldAction::SetSignText {
            location: spot(),
            expected: vec![expected.into()],
            lines: vec!["bye".into()],
        };

        assert!(matches!(apply_action(&mut world, &rewrite("other")).unwrap(), ApplyOutcome::Conflict(_)));
        assert_eq!(apply_action(&mut world, &rewrite("hello")).unwrap(), ApplyOutcome::Applied);
        assert_eq!(world.sign_text(&spot()), Some(vec!["bye".to_string()]));
    }

    #[tokio::test]
    async fn test_dispatcher_runs_on_simulation_thread() {
        let (dispatcher, queue) = simulation_channel();
        let stop = Arc::new(AtomicBool::new(false));

        let tick_stop = Arc::clone(&stop);
        let simulation = std::thread::spawn(move || {
            let mut world = MemoryWorld::new();
            while !tick_stop.load(Ordering::SeqCst) {
                queue.run_pending(&mut world);
                std::thread::sleep(Duration::from_millis(1));
            }
            world
        });

        assert_eq!(dispatcher.execute(set(None, Some("stone"))).await.unwrap(), ApplyOutcome::Applied);
        assert!(matches!(
            dispatcher.execute(set(None, Some("dirt"))).await.unwrap(),
            ApplyOutcome::Conflict(_)
        ));

        stop.store(true, Ordering::SeqCst);
        let world = simulation.join().unwrap();
        assert_eq!(world.block(&spot()), Some(BlockState::new("stone")));
    }

    #[tokio::test]
    async fn test_dispatcher_fails_without_simulation_thread() {
        let (dispatcher, queue) = simulation_channel();
        drop(queue);
        assert!(dispatcher.execute(WorldAction::Nothing).await.is_err());
    }

    #[test]
    fn test_run_at_most_respects_budget() {
        let (dispatcher, queue) = simulation_channel();
        let mut world = MemoryWorld::new();

        // A single poll enqueues the job; replies are never awaited
        for _ in 0..3 {
            assert!(dispatcher.execute(WorldAction::Nothing).now_or_never().is_none());
        }

        assert_eq!(queue.pending(), 3);
        assert_eq!(queue.run_at_most(&mut world, 2), 2);
        assert_eq!(queue.run_pending(&mut world), 1);
    }

    #[tokio::test]
    async fn test_direct_executor_shares_world() {
        let executor = DirectExecutor::new(MemoryWorld::new());
        executor.execute(set(None, Some("glass"))).await.unwrap();
        assert_eq!(executor.world().lock().block_count(), 1);
    }
}

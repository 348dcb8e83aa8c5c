// src/rollback/actions.rs
//! Inverse and forward world actions per event type
//!
//! The table is keyed by [`EventType`]; each entry maps a record to the
//! action that undoes it (rollback) or replays it (restore). Hosts can
//! register their own entries for custom handling.

use crate::record::{BlockState, EntitySnapshot, EventType, Location, Payload, Record};
use crate::rollback::Direction;
use crate::utils::errors::{EngineError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// One mutation of the live world, with the precondition it expects
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorldAction {
    /// Replace the block at `location`; `None` means air.
    ///
    /// Applies only while the current block has the type of `expected`.
    SetBlock {
        location: Location,
        expected: Option<BlockState>,
        replacement: Option<BlockState>,
    },

    /// Bring an entity back; conflicts if it is already present
    SpawnEntity {
        location: Location,
        entity: EntitySnapshot,
    },

    /// Remove an entity; conflicts if it is gone
    RemoveEntity {
        location: Location,
        entity: EntitySnapshot,
    },

    /// Rewrite a sign that currently reads `expected`
    SetSignText {
        location: Location,
        expected: Vec<String>,
        lines: Vec<String>,
    },

    /// Event has no world effect to invert (joins, commands)
    Nothing,
}

impl WorldAction {
    pub fn is_nothing(&self) -> bool {
        matches!(self, WorldAction::Nothing)
    }
}

impl fmt::Display for WorldAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn block(state: &Option<BlockState>) -> &str {
            state.as_ref().map_or("air", |state| state.block_type.as_str())
        }

        match self {
            WorldAction::SetBlock {
                location,
                expected,
                replacement,
            } => write!(
                f,
                "set {} -> {} at {}",
                block(expected),
                block(replacement),
                location
            ),
            WorldAction::SpawnEntity { location, entity } => {
                write!(f, "spawn {} at {}", entity.entity_type, location)
            }
            WorldAction::RemoveEntity { location, entity } => {
                write!(f, "remove {} at {}", entity.entity_type, location)
            }
            WorldAction::SetSignText { location, .. } => write!(f, "rewrite sign at {}", location),
            WorldAction::Nothing => f.write_str("nothing"),
        }
    }
}

/// Maps a record to a world action
pub type ActionFn = fn(&Record) -> Result<WorldAction>;

#[derive(Clone, Copy)]
struct ActionEntry {
    rollback: ActionFn,
    restore: ActionFn,
}

/// Lookup table from event type to rollback/restore actions
#[derive(Clone)]
pub struct ActionTable {
    entries: HashMap<EventType, ActionEntry>,
}

impl ActionTable {
    /// An empty table
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register (or replace) the actions for an event type
    pub fn register(&mut self, event: EventType, rollback: ActionFn, restore: ActionFn) {
        self.entries.insert(event, ActionEntry { rollback, restore });
    }

    pub fn rollback_action(&self, record: &Record) -> Result<WorldAction> {
        self.action_for(Direction::Rollback, record)
    }

    pub fn restore_action(&self, record: &Record) -> Result<WorldAction> {
        self.action_for(Direction::Restore, record)
    }

    pub fn action_for(&self, direction: Direction, record: &Record) -> Result<WorldAction> {
        let entry = self.entries.get(&record.event()).ok_or_else(|| {
            EngineError::World(format!("no action registered for {}", record.event()))
        })?;

        match direction {
            Direction::Rollback => (entry.rollback)(record),
            Direction::Restore => (entry.restore)(record),
        }
    }
}

impl Default for ActionTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.register(EventType::BlockBreak, undo_change, redo_change);
        table.register(EventType::BlockPlace, undo_change, redo_change);
        table.register(EventType::EntityDeath, undo_change, redo_change);
        table.register(EventType::SignEdit, undo_change, redo_change);
        table.register(EventType::PlayerJoin, no_action, no_action);
        table.register(EventType::PlayerDisconnect, no_action, no_action);
        table.register(EventType::CommandExecute, no_action, no_action);
        table
    }
}

fn location_of(record: &Record) -> Result<Location> {
    record
        .location()
        .cloned()
        .ok_or_else(|| EngineError::World(format!("{} record has no location", record.event())))
}

fn unsupported(record: &Record) -> EngineError {
    EngineError::World(format!(
        "{} record carries an unsupported payload",
        record.event()
    ))
}

fn no_action(_: &Record) -> Result<WorldAction> {
    Ok(WorldAction::Nothing)
}

/// Put the world back the way it was before the event
fn undo_change(record: &Record) -> Result<WorldAction> {
    let location = location_of(record)?;
    match (record.event(), record.payload()) {
        (_, Payload::BlockChange { before, after }) => Ok(WorldAction::SetBlock {
            location,
            expected: after.clone(),
            replacement: before.clone(),
        }),
        (EventType::BlockPlace, Payload::Entity(entity)) => Ok(WorldAction::RemoveEntity {
            location,
            entity: entity.clone(),
        }),
        (EventType::BlockBreak | EventType::EntityDeath, Payload::Entity(entity)) => {
            Ok(WorldAction::SpawnEntity {
                location,
                entity: entity.clone(),
            })
        }
        (EventType::SignEdit, Payload::Sign { before, after }) => Ok(WorldAction::SetSignText {
            location,
            expected: after.clone(),
            lines: before.clone(),
        }),
        _ => Err(unsupported(record)),
    }
}

/// Replay the event on the world
fn redo_change(record: &Record) -> Result<WorldAction> {
    let location = location_of(record)?;
    match (record.event(), record.payload()) {
        (_, Payload::BlockChange { before, after }) => Ok(WorldAction::SetBlock {
            location,
            expected: before.clone(),
            replacement: after.clone(),
        }),
        (EventType::BlockPlace, Payload::Entity(entity)) => Ok(WorldAction::SpawnEntity {
            location,
            entity: entity.clone(),
        }),
        (EventType::BlockBreak | EventType::EntityDeath, Payload::Entity(entity)) => {
            Ok(WorldAction::RemoveEntity {
                location,
                entity: entity.clone(),
            })
        }
        (EventType::SignEdit, Payload::Sign { before, after }) => Ok(WorldAction::SetSignText {
            location,
            expected: before.clone(),
            lines: after.clone(),
        }),
        _ => Err(unsupported(record)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{PlayerRef, RecordBuilder};

    fn here() -> Location {
        Location::block("world", 4, 70, -2)
    }

    #[test]
    fn test_block_break_inverts_to_prior_state() {
        let record = RecordBuilder::new(EventType::BlockBreak)
            .location(here())
            .block_break(BlockState::new("stone"))
            .build()
            .unwrap();
        let table = ActionTable::default();

        assert_eq!(
            table.rollback_action(&record).unwrap(),
            WorldAction::SetBlock {
                location: here(),
                expected: None,
                replacement: Some(BlockState::new("stone")),
            }
        );
        assert_eq!(
            table.restore_action(&record).unwrap(),
            WorldAction::SetBlock {
                location: here(),
                expected: Some(BlockState::new("stone")),
                replacement: None,
            }
        );
    }

    #[test]
    fn test_place_over_existing_block() {
        let record = RecordBuilder::new(EventType::BlockPlace)
            .location(here())
            .block_place(BlockState::new("dirt"), Some(BlockState::new("grass_block")))
            .build()
            .unwrap();

        let action = ActionTable::default().rollback_action(&record).unwrap();
        assert_eq!(
            action,
            WorldAction::SetBlock {
                location: here(),
                expected: Some(BlockState::new("dirt")),
                replacement: Some(BlockState::new("grass_block")),
            }
        );
        assert_eq!(action.to_string(), "set dirt -> grass_block at world @ 4, 70, -2");
    }

    #[test]
    fn test_entity_and_sign_actions() {
        let table = ActionTable::default();
        let cow = EntitySnapshot::new("minecraft:cow").with_uuid("c-1");
        let death = RecordBuilder::new(EventType::EntityDeath)
            .location(here())
            .entity(cow.clone())
            .build()
            .unwrap();
        assert!(matches!(
            table.rollback_action(&death).unwrap(),
            WorldAction::SpawnEntity { .. }
        ));
        assert!(matches!(
            table.restore_action(&death).unwrap(),
            WorldAction::RemoveEntity { .. }
        ));

        let sign = RecordBuilder::new(EventType::SignEdit)
            .location(here())
            .target("oak_sign")
            .sign_edit(vec!["old".into()], vec!["new".into()])
            .build()
            .unwrap();
        assert_eq!(
            table.rollback_action(&sign).unwrap(),
            WorldAction::SetSignText {
                location: here(),
                expected: vec!["new".into()],
                lines: vec!["old".into()],
            }
        );
    }

    #[test]
    fn test_non_world_events_do_nothing() {
        let record = RecordBuilder::new(EventType::PlayerJoin)
            .player(PlayerRef::new("u", "alice"))
            .build()
            .unwrap();
        assert!(ActionTable::default().rollback_action(&record).unwrap().is_nothing());
    }

    #[test]
    fn test_registered_override_wins() {
        fn refuse(_: &Record) -> Result<WorldAction> {
            Err(EngineError::World("refused".to_string()))
        }

        let mut table = ActionTable::default();
        table.register(EventType::PlayerJoin, refuse, refuse);
        let record = RecordBuilder::new(EventType::PlayerJoin)
            .player(PlayerRef::new("u", "alice"))
            .build()
            .unwrap();
        assert!(table.rollback_action(&record).is_err());
        assert!(ActionTable::empty().restore_action(&record).is_err());
    }
}

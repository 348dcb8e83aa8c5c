// src/record/builder.rs
//! Fluent record construction and validation
//!
//! One builder per event occurrence. `build` consumes the builder, so fields
//! can never leak from one event into the next.

use crate::record::{
    BlockState, Cause, EntitySnapshot, EventType, Location, Payload, PlayerRef, Record,
    SessionId, Target,
};
use crate::recording::RecordingQueueManager;
use crate::utils::errors::{Result, ValidationError};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::trace;

/// Builder for a single [`Record`]
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    event: EventType,
    location: Option<Location>,
    player: Option<PlayerRef>,
    source: Vec<Cause>,
    target: Option<Target>,
    payload: Payload,
    session: Option<SessionId>,
}

impl RecordBuilder {
    /// Create a builder for the given event type
    pub fn new(event: EventType) -> Self {
        Self {
            event,
            location: None,
            player: None,
            source: Vec::new(),
            target: None,
            payload: Payload::None,
            session: None,
        }
    }

    pub fn location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Responsible player; takes precedence over player causes
    pub fn player(mut self, player: PlayerRef) -> Self {
        self.player = Some(player);
        self
    }

    /// Append one cause to the causal chain
    pub fn cause(mut self, cause: Cause) -> Self {
        self.source.push(cause);
        self
    }

    pub fn causes(mut self, causes: impl IntoIterator<Item = Cause>) -> Self {
        self.source.extend(causes);
        self
    }

    /// Block or entity type id acted upon
    pub fn target(mut self, raw: &str) -> Self {
        self.target = Some(Target::new(raw));
        self
    }

    /// Free text target such as a command line
    pub fn raw_target(mut self, text: &str) -> Self {
        self.target = Some(Target::raw(text));
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// A block was removed; `prior` is what stood there
    pub fn block_break(self, prior: BlockState) -> Self {
        self.payload(Payload::BlockChange {
            before: Some(prior),
            after: None,
        })
    }

    /// A block was placed over `replaced` (`None` for air)
    pub fn block_place(self, placed: BlockState, replaced: Option<BlockState>) -> Self {
        self.payload(Payload::BlockChange {
            before: replaced,
            after: Some(placed),
        })
    }

    pub fn entity(self, entity: EntitySnapshot) -> Self {
        self.payload(Payload::Entity(entity))
    }

    pub fn sign_edit(self, before: Vec<String>, after: Vec<String>) -> Self {
        self.payload(Payload::Sign { before, after })
    }

    pub fn session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// Validate and stamp the record with the current time
    pub fn build(self) -> std::result::Result<Record, ValidationError> {
        self.build_at(Utc::now())
    }

    /// Validate and stamp the record with `timestamp`
    pub fn build_at(self, timestamp: DateTime<Utc>) -> std::result::Result<Record, ValidationError> {
        let event = self.event;

        if let Some(location) = &self.location {
            if location.world.trim().is_empty() {
                return Err(ValidationError::InvalidField {
                    field: "location",
                    reason: "world name is empty".to_string(),
                });
            }
            if !location.is_finite() {
                return Err(ValidationError::InvalidField {
                    field: "location",
                    reason: format!("non-finite coordinates ({})", location),
                });
            }
        } else if event.is_spatial() {
            return Err(missing("location", event));
        }

        check_payload(event, &self.payload)?;

        let target = match self.target {
            Some(target) => Some(target),
            None => derive_target(event, &self.payload),
        };
        if target.is_none() && (event.needs_target() || event == EventType::CommandExecute) {
            return Err(missing("target", event));
        }

        // Attribute blame to the first player in the causal chain
        let player = self.player.or_else(|| {
            self.source.iter().find_map(|cause| match cause {
                Cause::Player(player) => Some(player.clone()),
                _ => None,
            })
        });

        let record = Record {
            id: None,
            event,
            timestamp: truncate_to_micros(timestamp),
            location: self.location,
            player,
            source: self.source,
            target,
            payload: self.payload,
            session: self.session,
        };

        trace!("Built {} record", record.event());
        Ok(record)
    }

    /// Build and hand the record to the recording queue
    pub fn build_and_enqueue(self, queue: &RecordingQueueManager) -> Result<()> {
        let record = self.build()?;
        queue.enqueue(record)
    }
}

fn missing(field: &'static str, event: EventType) -> ValidationError {
    ValidationError::MissingField {
        field,
        event: event.to_string(),
    }
}

fn invalid_payload(event: EventType, payload: &Payload) -> ValidationError {
    let kind = match payload {
        Payload::BlockChange { .. } => "block change",
        Payload::Entity(_) => "entity",
        Payload::Sign { .. } => "sign",
        Payload::None => "empty",
    };
    ValidationError::InvalidField {
        field: "payload",
        reason: format!("{} payload cannot describe {}", kind, event),
    }
}

fn check_payload(event: EventType, payload: &Payload) -> std::result::Result<(), ValidationError> {
    let ok = match (event, payload) {
        (EventType::BlockBreak | EventType::BlockPlace, Payload::None) => {
            return Err(missing("payload", event))
        }
        (EventType::BlockBreak, Payload::BlockChange { before, .. }) => before.is_some(),
        (EventType::BlockPlace, Payload::BlockChange { after, .. }) => after.is_some(),
        (EventType::BlockBreak | EventType::BlockPlace, Payload::Entity(_)) => true,
        (EventType::EntityDeath, Payload::Entity(_)) => true,
        (EventType::EntityDeath | EventType::SignEdit, Payload::None) => {
            return Err(missing("payload", event))
        }
        (EventType::SignEdit, Payload::Sign { .. }) => true,
        (
            EventType::PlayerJoin | EventType::PlayerDisconnect | EventType::CommandExecute,
            Payload::None,
        ) => true,
        _ => false,
    };

    if ok {
        Ok(())
    } else {
        Err(invalid_payload(event, payload))
    }
}

fn derive_target(event: EventType, payload: &Payload) -> Option<Target> {
    match (event, payload) {
        (EventType::BlockBreak, Payload::BlockChange { before: Some(state), .. }) => {
            Some(Target::new(&state.block_type))
        }
        (EventType::BlockPlace, Payload::BlockChange { after: Some(state), .. }) => {
            Some(Target::new(&state.block_type))
        }
        (_, Payload::Entity(entity)) => Some(Target::new(&entity.entity_type)),
        _ => None,
    }
}

fn truncate_to_micros(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(timestamp.timestamp_micros()).unwrap_or(timestamp)
}

/// Per-producer clock that never goes backwards
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_micros: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time, or the last issued time if the wall clock stepped back
    pub fn now(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let previous = self.last_micros.fetch_max(now, Ordering::AcqRel);
        let micros = previous.max(now);
        DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
    }
}

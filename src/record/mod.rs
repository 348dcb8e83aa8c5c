// src/record/mod.rs
//! Immutable world event records
//!
//! A [`Record`] describes one change to the world. It is built once through
//! [`RecordBuilder`], never mutated afterwards, and gains an id only when a
//! storage adapter persists it.
//!
//! # Shape
//!
//! ```text
//! Record
//! ├─ event      block-break | block-place | entity-death | sign-edit | ...
//! ├─ timestamp  set at build time (microsecond precision)
//! ├─ location   world + x/y/z (required for spatial events)
//! ├─ player     responsible actor, if any
//! ├─ source     causal chain (player, block, entity, plugin)
//! ├─ target     canonical id + display form
//! ├─ payload    state needed to invert the change
//! └─ session    groups records from one logical operation
//! ```

pub mod builder;

pub use builder::{MonotonicClock, RecordBuilder};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Backend-assigned record identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates records produced by one logical operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Ulid);

impl SessionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kinds of recorded world changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    BlockBreak,
    BlockPlace,
    EntityDeath,
    SignEdit,
    PlayerJoin,
    PlayerDisconnect,
    CommandExecute,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::BlockBreak,
        EventType::BlockPlace,
        EventType::EntityDeath,
        EventType::SignEdit,
        EventType::PlayerJoin,
        EventType::PlayerDisconnect,
        EventType::CommandExecute,
    ];

    /// Stable name used in storage and query tokens
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BlockBreak => "block-break",
            EventType::BlockPlace => "block-place",
            EventType::EntityDeath => "entity-death",
            EventType::SignEdit => "sign-edit",
            EventType::PlayerJoin => "player-join",
            EventType::PlayerDisconnect => "player-disconnect",
            EventType::CommandExecute => "command-execute",
        }
    }

    /// Events that must carry a location
    pub fn is_spatial(&self) -> bool {
        !matches!(self, EventType::PlayerJoin | EventType::PlayerDisconnect)
    }

    /// Events acting on a block or entity, which need a target
    pub fn needs_target(&self) -> bool {
        matches!(
            self,
            EventType::BlockBreak | EventType::BlockPlace | EventType::EntityDeath
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        EventType::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == needle)
            .ok_or_else(|| format!("unknown event type `{}`", s))
    }
}

/// A position in a named world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Location {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }

    /// Location of a block at integer coordinates
    pub fn block(world: impl Into<String>, x: i64, y: i64, z: i64) -> Self {
        Self::new(world, x as f64, y as f64, z as f64)
    }

    /// Integer block coordinates containing this location
    pub fn block_key(&self) -> BlockKey {
        BlockKey {
            world: self.world.clone(),
            x: self.x.floor() as i64,
            y: self.y.floor() as i64,
            z: self.z.floor() as i64,
        }
    }

    pub fn distance_squared(&self, other: &Location) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    /// Same world and within `radius` (inclusive)
    pub fn is_within(&self, center: &Location, radius: f64) -> bool {
        self.world == center.world && self.distance_squared(center) <= radius * radius
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}, {}, {}", self.world, self.x, self.y, self.z)
    }
}

/// Integer block coordinates, used to key world state
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub world: String,
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

/// The actor held responsible for a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRef {
    /// Stable identity (UUID string)
    pub id: String,

    /// Display name at the time of the event
    pub name: String,
}

impl PlayerRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Case-insensitive match on name or id, same folding the backends store
    pub fn matches(&self, needle: &str) -> bool {
        let needle = normalize_player_needle(needle);
        normalize_player_needle(&self.name) == needle || normalize_player_needle(&self.id) == needle
    }
}

/// One link in the causal chain behind a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cause {
    Player(PlayerRef),
    Block { block_type: String, location: Option<Location> },
    Entity { entity_type: String },
    Plugin { name: String },
}

/// Normalized identifier of the object acted upon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Canonical id, lower-case (e.g. `minecraft:oak_log`)
    pub id: String,

    /// Human readable form (e.g. `oak log`)
    pub display: String,
}

impl Target {
    pub fn new(raw: &str) -> Self {
        let id = normalize_target_needle(raw);
        let display = local_part(&id).replace('_', " ");
        Self { id, display }
    }

    /// Free text target (e.g. a command line), kept verbatim for display
    pub fn raw(text: &str) -> Self {
        let display = text.trim().to_string();
        Self {
            id: normalize_target_needle(&display),
            display,
        }
    }

    /// Id without namespace (`minecraft:stone` -> `stone`)
    pub fn local_id(&self) -> &str {
        local_part(&self.id)
    }

    /// Whether a user supplied needle names this target
    pub fn matches(&self, needle: &str) -> bool {
        let needle = normalize_target_needle(needle);
        self.id == needle || self.local_id() == needle
    }
}

fn local_part(id: &str) -> &str {
    id.rsplit_once(':').map(|(_, local)| local).unwrap_or(id)
}

/// Canonical form of a target id or needle as used for matching
pub fn normalize_target_needle(needle: &str) -> String {
    needle.trim().to_lowercase().replace(' ', "_")
}

/// Player names and ids fold with Unicode lower-casing
pub fn normalize_player_needle(needle: &str) -> String {
    needle.trim().to_lowercase()
}

/// State of a single block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockState {
    pub block_type: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl BlockState {
    pub fn new(block_type: impl Into<String>) -> Self {
        Self {
            block_type: block_type.into().to_lowercase(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Same block type, ignoring properties
    pub fn same_type(&self, other: &BlockState) -> bool {
        self.block_type == other.block_type
    }
}

/// Everything needed to bring an entity back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_type: String,

    /// Unique id of the entity instance, when the host has one
    pub uuid: Option<String>,

    pub custom_name: Option<String>,

    /// Hanging entities and armor stands are treated like blocks
    #[serde(default)]
    pub block_like: bool,

    /// Host specific serialized entity data
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EntitySnapshot {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into().to_lowercase(),
            uuid: None,
            custom_name: None,
            block_like: false,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn block_like(mut self) -> Self {
        self.block_like = true;
        self
    }
}

/// Event-specific state required to invert or replay a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Block state before and after; `None` means air
    BlockChange {
        before: Option<BlockState>,
        after: Option<BlockState>,
    },
    Entity(EntitySnapshot),
    Sign {
        before: Vec<String>,
        after: Vec<String>,
    },
    None,
}

/// An immutable record of one world event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RecordId>,
    event: EventType,
    timestamp: DateTime<Utc>,
    location: Option<Location>,
    player: Option<PlayerRef>,
    #[serde(default)]
    source: Vec<Cause>,
    target: Option<Target>,
    payload: Payload,
    session: Option<SessionId>,
}

impl Record {
    /// Start building a record for the given event
    pub fn builder(event: EventType) -> RecordBuilder {
        RecordBuilder::new(event)
    }

    pub fn id(&self) -> Option<RecordId> {
        self.id
    }

    pub fn event(&self) -> EventType {
        self.event
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Timestamp as integer microseconds since the epoch
    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp.timestamp_micros()
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn player(&self) -> Option<&PlayerRef> {
        self.player.as_ref()
    }

    pub fn source(&self) -> &[Cause] {
        &self.source
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Attach the id assigned by a storage adapter.
    ///
    /// An id, once present, is never replaced.
    pub fn into_persisted(mut self, id: RecordId) -> Self {
        if self.id.is_none() {
            self.id = Some(id);
        }
        self
    }

    /// Ordering key: timestamp, then id
    pub fn sort_key(&self) -> (i64, u64) {
        (self.timestamp_micros(), self.id.map(|id| id.0).unwrap_or(0))
    }
}

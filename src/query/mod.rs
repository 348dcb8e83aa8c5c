// src/query/mod.rs
//! Conditions and query sessions
//!
//! A [`QuerySession`] is built per lookup, rollback or restore, filled by the
//! parameter handlers, consumed once by a storage adapter and then dropped.
//!
//! Conditions inside a [`ConditionGroup`] are ANDed; groups are ORed:
//!
//! ```text
//! (p:alice AND r:10)  OR  (a:block-break AND w:nether)
//!  └──── group 0 ───┘      └────────── group 1 ──────┘
//! ```

pub mod grouping;

pub use grouping::{group_records, LookupResults, ResultGroup};

use crate::record::{normalize_target_needle, EventType, Location, Record, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single predicate term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// `since` inclusive, `before` exclusive
    TimeRange {
        since: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    },

    /// Same world, Euclidean distance within `radius` (inclusive)
    Within { center: Location, radius: f64 },

    World(String),

    /// Any of the given player names or ids
    Players(Vec<String>),

    /// Any of the given event types
    Events(Vec<EventType>),

    /// Any of the given target needles
    Targets(Vec<String>),

    Session(SessionId),

    /// Whether the record has been rolled back
    Reversed(bool),
}

impl Condition {
    pub fn since(since: DateTime<Utc>) -> Self {
        Condition::TimeRange {
            since: Some(since),
            before: None,
        }
    }

    pub fn before(before: DateTime<Utc>) -> Self {
        Condition::TimeRange {
            since: None,
            before: Some(before),
        }
    }

    pub fn within(center: Location, radius: f64) -> Self {
        Condition::Within { center, radius }
    }

    pub fn player(name: impl Into<String>) -> Self {
        Condition::Players(vec![name.into()])
    }

    pub fn event(event: EventType) -> Self {
        Condition::Events(vec![event])
    }

    pub fn target(needle: impl Into<String>) -> Self {
        Condition::Targets(vec![needle.into()])
    }

    /// Whether this condition narrows results spatially
    pub fn is_spatial(&self) -> bool {
        matches!(self, Condition::Within { .. } | Condition::World(_))
    }

    /// Evaluate against a record and its rolled-back state
    pub fn matches(&self, record: &Record, reversed: bool) -> bool {
        match self {
            Condition::TimeRange { since, before } => {
                let ts = record.timestamp();
                since.map_or(true, |since| ts >= since) && before.map_or(true, |before| ts < before)
            }
            Condition::Within { center, radius } => record
                .location()
                .map_or(false, |location| location.is_within(center, *radius)),
            Condition::World(world) => record
                .location()
                .map_or(false, |location| location.world == *world),
            Condition::Players(names) => record
                .player()
                .map_or(false, |player| names.iter().any(|name| player.matches(name))),
            Condition::Events(events) => events.contains(&record.event()),
            Condition::Targets(needles) => record
                .target()
                .map_or(false, |target| needles.iter().any(|needle| target.matches(needle))),
            Condition::Session(session) => record.session() == Some(*session),
            Condition::Reversed(expected) => reversed == *expected,
        }
    }
}

/// Conditions combined with logical AND
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    conditions: Vec<Condition>,
}

impl ConditionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, condition: Condition) -> Self {
        self.add(condition);
        self
    }

    pub fn add(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn has_spatial(&self) -> bool {
        self.conditions.iter().any(Condition::is_spatial)
    }

    pub fn constrains_reversed(&self) -> bool {
        self.conditions
            .iter()
            .any(|condition| matches!(condition, Condition::Reversed(_)))
    }

    pub fn matches(&self, record: &Record, reversed: bool) -> bool {
        self.conditions
            .iter()
            .all(|condition| condition.matches(record, reversed))
    }
}

/// Behaviour modifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    /// Return every record instead of collapsing near duplicates
    NoGroup,

    /// Compute rollback/restore actions without touching the world
    DryRun,
}

/// Result ordering by timestamp
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Newest first
    #[default]
    Descending,

    /// Oldest first
    Ascending,
}

/// Who asked for the query; opaque to the engine beyond its location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requester {
    pub name: String,
    pub location: Option<Location>,
}

impl Requester {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: None,
        }
    }

    pub fn console() -> Self {
        Self::new("console")
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }
}

/// Default rows fetched per storage round trip
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// A request-scoped query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySession {
    requester: Requester,
    groups: Vec<ConditionGroup>,
    flags: BTreeSet<Flag>,
    sort: SortOrder,
    limit: Option<usize>,
    page_size: usize,
}

impl QuerySession {
    pub fn new(requester: Requester) -> Self {
        Self {
            requester,
            groups: Vec::new(),
            flags: BTreeSet::new(),
            sort: SortOrder::default(),
            limit: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    pub fn groups(&self) -> &[ConditionGroup] {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut [ConditionGroup] {
        &mut self.groups
    }

    /// Start a new OR group; later conditions land in it
    pub fn new_group(&mut self) -> &mut ConditionGroup {
        let index = self.groups.len();
        self.groups.push(ConditionGroup::new());
        &mut self.groups[index]
    }

    /// The group conditions are currently added to
    pub fn current_group(&mut self) -> &mut ConditionGroup {
        if self.groups.is_empty() {
            return self.new_group();
        }
        let last = self.groups.len() - 1;
        &mut self.groups[last]
    }

    /// Add a condition to the current group
    pub fn add_condition(&mut self, condition: Condition) -> &mut Self {
        self.current_group().add(condition);
        self
    }

    pub fn add_group(&mut self, group: ConditionGroup) -> &mut Self {
        self.groups.push(group);
        self
    }

    /// Add a condition to every group (or to a fresh one when there are none)
    pub fn constrain_all(&mut self, condition: Condition) {
        if self.groups.is_empty() {
            self.new_group();
        }
        for group in &mut self.groups {
            group.add(condition.clone());
        }
    }

    pub fn add_flag(&mut self, flag: Flag) -> &mut Self {
        self.flags.insert(flag);
        self
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn flags(&self) -> impl Iterator<Item = Flag> + '_ {
        self.flags.iter().copied()
    }

    pub fn sort(&self) -> SortOrder {
        self.sort
    }

    pub fn set_sort(&mut self, sort: SortOrder) -> &mut Self {
        self.sort = sort;
        self
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn set_limit(&mut self, limit: Option<usize>) -> &mut Self {
        self.limit = limit;
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn set_page_size(&mut self, page_size: usize) -> &mut Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Reference evaluation of the whole condition set
    pub fn matches(&self, record: &Record, reversed: bool) -> bool {
        // Empty groups are dropped by every backend translation as well
        let mut groups = self.groups.iter().filter(|group| !group.is_empty()).peekable();
        if groups.peek().is_none() {
            return true;
        }
        groups.any(|group| group.matches(record, reversed))
    }

    /// Non-empty groups, in order
    pub fn effective_groups(&self) -> impl Iterator<Item = &ConditionGroup> {
        self.groups.iter().filter(|group| !group.is_empty())
    }
}

/// Target needles in the canonical matching form
pub(crate) fn normalize_targets(needles: &[String]) -> Vec<String> {
    needles.iter().map(|needle| normalize_target_needle(needle)).collect()
}

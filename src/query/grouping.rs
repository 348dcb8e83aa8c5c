// src/query/grouping.rs
//! Optional post-query grouping of lookup results
//!
//! Grouping runs after the storage query and never changes which records
//! matched. Records sharing event, target, player and world collapse into a
//! single [`ResultGroup`]; the `-nogroup` flag or `query.group_by_default =
//! false` returns them individually.

use crate::record::{EventType, Record};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Records collapsed under one key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultGroup {
    pub event: EventType,
    pub target: Option<String>,
    pub player: Option<String>,
    pub world: Option<String>,
    pub count: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// What a lookup hands back to the requester
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", content = "results", rename_all = "snake_case")]
pub enum LookupResults {
    Grouped(Vec<ResultGroup>),
    Individual(Vec<Record>),
}

impl LookupResults {
    /// Number of underlying records
    pub fn record_count(&self) -> usize {
        match self {
            LookupResults::Grouped(groups) => groups.iter().map(|group| group.count).sum(),
            LookupResults::Individual(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }
}

type GroupKey = (EventType, Option<String>, Option<String>, Option<String>);

/// Collapse records into groups, keeping the order of first appearance
pub fn group_records(records: &[Record]) -> Vec<ResultGroup> {
    let mut index: HashMap<GroupKey, usize> = HashMap::new();
    let mut groups: Vec<ResultGroup> = Vec::new();

    for record in records {
        let key: GroupKey = (
            record.event(),
            record.target().map(|target| target.display.clone()),
            record.player().map(|player| player.name.clone()),
            record.location().map(|location| location.world.clone()),
        );

        match index.get(&key) {
            Some(&position) => {
                let group = &mut groups[position];
                group.count += 1;
                group.first_seen = group.first_seen.min(record.timestamp());
                group.last_seen = group.last_seen.max(record.timestamp());
            }
            None => {
                index.insert(key.clone(), groups.len());
                groups.push(ResultGroup {
                    event: key.0,
                    target: key.1,
                    player: key.2,
                    world: key.3,
                    count: 1,
                    first_seen: record.timestamp(),
                    last_seen: record.timestamp(),
                });
            }
        }
    }

    groups
}

// src/storage/sql.rs
//! SQL shared by the embedded and relational backends
//!
//! Both engines store one row per record: indexed columns for filtering plus
//! the full record as a JSON `body`. Conditions are translated into a WHERE
//! clause with positional parameters; each backend converts [`SqlValue`] into
//! its driver's value type.

use crate::query::{normalize_targets, Condition, QuerySession, SortOrder};
use crate::record::{normalize_player_needle, Record, RecordId};
use crate::storage::Cursor;
use crate::utils::errors::Result;

/// Column types are chosen to mean the same thing in SQLite and DuckDB
pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id BIGINT PRIMARY KEY,
    event VARCHAR NOT NULL,
    ts BIGINT NOT NULL,
    world VARCHAR,
    x DOUBLE,
    y DOUBLE,
    z DOUBLE,
    player_id VARCHAR,
    player_name VARCHAR,
    target_id VARCHAR,
    target_local VARCHAR,
    session VARCHAR,
    reversed BIGINT NOT NULL DEFAULT 0,
    body VARCHAR NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_records_world_ts ON records(world, ts);
CREATE INDEX IF NOT EXISTS idx_records_event ON records(event);
CREATE INDEX IF NOT EXISTS idx_records_player ON records(player_name);
CREATE INDEX IF NOT EXISTS idx_records_coords ON records(world, x, z);
"#;

pub(crate) const INSERT: &str = "INSERT INTO records \
    (id, event, ts, world, x, y, z, player_id, player_name, target_id, target_local, session, reversed, body) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

pub(crate) const MAX_ID: &str = "SELECT COALESCE(MAX(id), 0) FROM records";

/// Ids per UPDATE statement
pub(crate) const UPDATE_CHUNK: usize = 500;

/// Driver independent parameter value
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    fn text(value: impl Into<String>) -> Self {
        SqlValue::Text(value.into())
    }

    fn optional_text(value: Option<impl Into<String>>) -> Self {
        value.map(SqlValue::text).unwrap_or(SqlValue::Null)
    }

    fn optional_real(value: Option<f64>) -> Self {
        value.map(SqlValue::Real).unwrap_or(SqlValue::Null)
    }
}

/// A WHERE clause and its parameters, in order
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SqlFilter {
    pub clause: String,
    pub params: Vec<SqlValue>,
}

/// Translate the session's condition groups into a WHERE clause
pub(crate) fn translate(session: &QuerySession) -> SqlFilter {
    let mut params = Vec::new();
    let mut groups = Vec::new();

    for group in session.effective_groups() {
        let terms: Vec<String> = group
            .conditions()
            .iter()
            .map(|condition| translate_condition(condition, &mut params))
            .collect();
        groups.push(format!("({})", terms.join(" AND ")));
    }

    let clause = if groups.is_empty() {
        "1=1".to_string()
    } else {
        groups.join(" OR ")
    };

    SqlFilter { clause, params }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn translate_condition(condition: &Condition, params: &mut Vec<SqlValue>) -> String {
    match condition {
        Condition::TimeRange { since, before } => {
            let mut terms = Vec::new();
            if let Some(since) = since {
                terms.push("ts >= ?");
                params.push(SqlValue::Integer(since.timestamp_micros()));
            }
            if let Some(before) = before {
                terms.push("ts < ?");
                params.push(SqlValue::Integer(before.timestamp_micros()));
            }
            if terms.is_empty() {
                "1=1".to_string()
            } else {
                format!("({})", terms.join(" AND "))
            }
        }
        Condition::Within { center, radius } => {
            // Box prefilter for the coordinate index, padded so float rounding
            // never excludes a point the exact check would accept
            let pad = radius + 1.0;
            params.push(SqlValue::text(center.world.clone()));
            for axis in [center.x, center.y, center.z] {
                params.push(SqlValue::Real(axis - pad));
                params.push(SqlValue::Real(axis + pad));
            }
            for axis in [center.x, center.y, center.z] {
                params.push(SqlValue::Real(axis));
                params.push(SqlValue::Real(axis));
            }
            params.push(SqlValue::Real(radius * radius));
            "(world = ? AND x BETWEEN ? AND ? AND y BETWEEN ? AND ? AND z BETWEEN ? AND ? \
             AND ((x - ?) * (x - ?) + (y - ?) * (y - ?) + (z - ?) * (z - ?)) <= ?)"
                .to_string()
        }
        Condition::World(world) => {
            params.push(SqlValue::text(world.clone()));
            "world = ?".to_string()
        }
        Condition::Players(names) => {
            if names.is_empty() {
                return "1=0".to_string();
            }
            let needles: Vec<String> = names.iter().map(|name| normalize_player_needle(name)).collect();
            params.extend(needles.iter().cloned().map(SqlValue::Text));
            params.extend(needles.into_iter().map(SqlValue::Text));
            let marks = placeholders(names.len());
            format!("(player_name IN ({}) OR player_id IN ({}))", marks, marks)
        }
        Condition::Events(events) => {
            if events.is_empty() {
                return "1=0".to_string();
            }
            params.extend(events.iter().map(|event| SqlValue::text(event.as_str())));
            format!("event IN ({})", placeholders(events.len()))
        }
        Condition::Targets(needles) => {
            if needles.is_empty() {
                return "1=0".to_string();
            }
            let needles = normalize_targets(needles);
            params.extend(needles.iter().cloned().map(SqlValue::Text));
            params.extend(needles.iter().cloned().map(SqlValue::Text));
            let marks = placeholders(needles.len());
            format!("(target_id IN ({}) OR target_local IN ({}))", marks, marks)
        }
        Condition::Session(session) => {
            params.push(SqlValue::text(session.to_string()));
            "session = ?".to_string()
        }
        Condition::Reversed(reversed) => {
            params.push(SqlValue::Integer(i64::from(*reversed)));
            "reversed = ?".to_string()
        }
    }
}

/// SELECT for one keyset page
pub(crate) fn page_query(
    filter: &SqlFilter,
    sort: SortOrder,
    cursor: Option<Cursor>,
    page_size: usize,
) -> (String, Vec<SqlValue>) {
    let mut params = filter.params.clone();
    let (direction, comparison) = match sort {
        SortOrder::Descending => ("DESC", "<"),
        SortOrder::Ascending => ("ASC", ">"),
    };

    let mut sql = format!("SELECT id, reversed, body FROM records WHERE ({})", filter.clause);
    if let Some(cursor) = cursor {
        sql.push_str(&format!(
            " AND (ts {cmp} ? OR (ts = ? AND id {cmp} ?))",
            cmp = comparison
        ));
        params.push(SqlValue::Integer(cursor.timestamp_micros));
        params.push(SqlValue::Integer(cursor.timestamp_micros));
        params.push(SqlValue::Integer(cursor.id as i64));
    }
    sql.push_str(&format!(
        " ORDER BY ts {dir}, id {dir} LIMIT {}",
        page_size,
        dir = direction
    ));

    (sql, params)
}

/// Column values for [`INSERT`]
pub(crate) fn insert_params(id: RecordId, record: &Record) -> Result<Vec<SqlValue>> {
    let body = serde_json::to_string(record)?;
    let location = record.location();
    let player = record.player();
    let target = record.target();

    Ok(vec![
        SqlValue::Integer(id.0 as i64),
        SqlValue::text(record.event().as_str()),
        SqlValue::Integer(record.timestamp_micros()),
        SqlValue::optional_text(location.map(|location| location.world.clone())),
        SqlValue::optional_real(location.map(|location| location.x)),
        SqlValue::optional_real(location.map(|location| location.y)),
        SqlValue::optional_real(location.map(|location| location.z)),
        SqlValue::optional_text(player.map(|player| normalize_player_needle(&player.id))),
        SqlValue::optional_text(player.map(|player| normalize_player_needle(&player.name))),
        SqlValue::optional_text(target.map(|target| target.id.clone())),
        SqlValue::optional_text(target.map(|target| target.local_id().to_string())),
        SqlValue::optional_text(record.session().map(|session| session.to_string())),
        SqlValue::Integer(0),
        SqlValue::Text(body),
    ])
}

/// UPDATE statements marking `ids`, chunked
pub(crate) fn reversed_updates(ids: &[RecordId], reversed: bool) -> Vec<(String, Vec<SqlValue>)> {
    ids.chunks(UPDATE_CHUNK)
        .map(|chunk| {
            let sql = format!(
                "UPDATE records SET reversed = ? WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let mut params = Vec::with_capacity(chunk.len() + 1);
            params.push(SqlValue::Integer(i64::from(reversed)));
            params.extend(chunk.iter().map(|id| SqlValue::Integer(id.0 as i64)));
            (sql, params)
        })
        .collect()
}

/// Rebuild a record from its stored row
pub(crate) fn decode_row(id: i64, body: &str) -> Result<Record> {
    let record: Record = serde_json::from_str(body)?;
    Ok(record.into_persisted(RecordId(id as u64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ConditionGroup, Requester};
    use crate::record::{EventType, Location};

    #[test]
    fn test_groups_are_ored() {
        let mut session = QuerySession::new(Requester::console());
        session.add_condition(Condition::player("Alice"));
        session.add_group(ConditionGroup::new().with(Condition::event(EventType::BlockBreak)));

        let filter = translate(&session);
        assert_eq!(
            filter.clause,
            "((player_name IN (?) OR player_id IN (?))) OR (event IN (?))"
        );
        assert_eq!(
            filter.params,
            vec![
                SqlValue::text("alice"),
                SqlValue::text("alice"),
                SqlValue::text("block-break"),
            ]
        );
    }

    #[test]
    fn test_empty_session_matches_all() {
        let session = QuerySession::new(Requester::console());
        let filter = translate(&session);
        assert_eq!(filter.clause, "1=1");
        assert!(filter.params.is_empty());
    }

    #[test]
    fn test_radius_binds_squared_distance() {
        let mut session = QuerySession::new(Requester::console());
        session.add_condition(Condition::within(Location::block("world", 0, 64, 0), 5.0));

        let filter = translate(&session);
        assert!(filter.clause.contains("<= ?"));
        assert_eq!(filter.params.len(), 14);
        assert_eq!(filter.params.last(), Some(&SqlValue::Real(25.0)));
    }

    #[test]
    fn test_page_query_cursor_direction() {
        let filter = SqlFilter {
            clause: "1=1".to_string(),
            params: Vec::new(),
        };
        let cursor = Cursor {
            timestamp_micros: 10,
            id: 3,
        };

        let (sql, params) = page_query(&filter, SortOrder::Descending, Some(cursor), 50);
        assert!(sql.contains("(ts < ? OR (ts = ? AND id < ?))"));
        assert!(sql.ends_with("ORDER BY ts DESC, id DESC LIMIT 50"));
        assert_eq!(params.len(), 3);

        let (sql, _) = page_query(&filter, SortOrder::Ascending, None, 50);
        assert!(sql.ends_with("ORDER BY ts ASC, id ASC LIMIT 50"));
    }

    #[test]
    fn test_reversed_updates_are_chunked() {
        let ids: Vec<RecordId> = (1..=1200).map(RecordId).collect();
        let updates = reversed_updates(&ids, true);
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].1.len(), UPDATE_CHUNK + 1);
        assert_eq!(updates[0].1[0], SqlValue::Integer(1));
    }
}

// src/storage/document/filter.rs
//! Filter documents for the document backend
//!
//! A session translates into a JSON filter in the familiar document-store
//! dialect:
//!
//! ```text
//! { "$or": [
//!     { "$and": [ { "player_name": { "$in": ["alice"] } },
//!                 { "world": "world", "loc": { "$near": { "center": [0, 64, 0], "max_distance": 5 } } } ] },
//!     { "$and": [ { "event": { "$in": ["block-break"] } } ] }
//! ] }
//! ```
//!
//! Supported operators: `$and`, `$or`, `$in`, `$eq`, `$ne`, `$gt`, `$gte`,
//! `$lt`, `$lte` and `$near` (inclusive Euclidean distance on a `[x, y, z]`
//! array).

use crate::query::{normalize_targets, Condition, QuerySession};
use crate::record::normalize_player_needle;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

/// Translate a session into a filter document
pub fn translate(session: &QuerySession) -> Value {
    let groups: Vec<Value> = session
        .effective_groups()
        .map(|group| {
            let terms: Vec<Value> = group.conditions().iter().map(translate_condition).collect();
            json!({ "$and": terms })
        })
        .collect();

    if groups.is_empty() {
        json!({})
    } else {
        json!({ "$or": groups })
    }
}

fn translate_condition(condition: &Condition) -> Value {
    match condition {
        Condition::TimeRange { since, before } => {
            let mut range = Map::new();
            if let Some(since) = since {
                range.insert("$gte".to_string(), json!(since.timestamp_micros()));
            }
            if let Some(before) = before {
                range.insert("$lt".to_string(), json!(before.timestamp_micros()));
            }
            if range.is_empty() {
                json!({})
            } else {
                json!({ "ts": Value::Object(range) })
            }
        }
        Condition::Within { center, radius } => json!({
            "world": center.world,
            "loc": { "$near": { "center": [center.x, center.y, center.z], "max_distance": radius } }
        }),
        Condition::World(world) => json!({ "world": world }),
        Condition::Players(names) => {
            let needles: Vec<String> = names.iter().map(|name| normalize_player_needle(name)).collect();
            json!({ "$or": [
                { "player_name": { "$in": needles } },
                { "player_id": { "$in": needles } }
            ] })
        }
        Condition::Events(events) => {
            let names: Vec<&str> = events.iter().map(|event| event.as_str()).collect();
            json!({ "event": { "$in": names } })
        }
        Condition::Targets(needles) => {
            let needles = normalize_targets(needles);
            json!({ "$or": [
                { "target_id": { "$in": needles } },
                { "target_local": { "$in": needles } }
            ] })
        }
        Condition::Session(session) => json!({ "session": session.to_string() }),
        Condition::Reversed(reversed) => json!({ "reversed": reversed }),
    }
}

/// Evaluate a filter document against a stored document
pub fn matches(filter: &Value, document: &Value) -> bool {
    let Some(filter) = filter.as_object() else {
        return false;
    };

    filter.iter().all(|(key, expected)| match key.as_str() {
        "$and" => expected
            .as_array()
            .map_or(false, |terms| terms.iter().all(|term| matches(term, document))),
        "$or" => expected
            .as_array()
            .map_or(false, |terms| terms.iter().any(|term| matches(term, document))),
        field => field_matches(document.get(field), expected),
    })
}

fn is_operator_object(value: &Value) -> bool {
    value
        .as_object()
        .map_or(false, |object| !object.is_empty() && object.keys().all(|key| key.starts_with('$')))
}

fn field_matches(actual: Option<&Value>, expected: &Value) -> bool {
    if !is_operator_object(expected) {
        return actual.map_or(expected.is_null(), |actual| values_equal(actual, expected));
    }

    let Some(operators) = expected.as_object() else {
        return false;
    };

    operators.iter().all(|(operator, operand)| {
        let Some(actual) = actual else {
            return operator == "$ne";
        };
        match operator.as_str() {
            "$eq" => values_equal(actual, operand),
            "$ne" => !values_equal(actual, operand),
            "$in" => operand
                .as_array()
                .map_or(false, |options| options.iter().any(|option| values_equal(actual, option))),
            "$gt" => compare(actual, operand) == Some(Ordering::Greater),
            "$gte" => matches!(compare(actual, operand), Some(Ordering::Greater | Ordering::Equal)),
            "$lt" => compare(actual, operand) == Some(Ordering::Less),
            "$lte" => matches!(compare(actual, operand), Some(Ordering::Less | Ordering::Equal)),
            "$near" => near(actual, operand),
            _ => false,
        }
    })
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(_), Value::Number(_)) => compare(actual, expected) == Some(Ordering::Equal),
        _ => actual == expected,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn point(value: &Value) -> Option<[f64; 3]> {
    let items = value.as_array()?;
    if items.len() != 3 {
        return None;
    }
    Some([items[0].as_f64()?, items[1].as_f64()?, items[2].as_f64()?])
}

fn near(actual: &Value, operand: &Value) -> bool {
    let (Some(location), Some(center), Some(max_distance)) = (
        point(actual),
        operand.get("center").and_then(point),
        operand.get("max_distance").and_then(Value::as_f64),
    ) else {
        return false;
    };

    let dx = location[0] - center[0];
    let dy = location[1] - center[1];
    let dz = location[2] - center[2];
    dx * dx + dy * dy + dz * dz <= max_distance * max_distance
}

//! Deterministic metadata merge customizer
//!
//! Both cache tiers and confirmation reconciliation apply the same rule,
//! so a record merged in memory, on disk, or during read-back always
//! converges to the same value:
//! - scalar fields: the incoming value overwrites
//! - nested objects: merged recursively
//! - arrays: concatenated, then de-duplicated by the per-kind key for
//!   that field (whole-value equality when no key is configured)

use crate::kind::KindStrategy;
use serde_json::{Map, Value};

/// Merge `incoming` into `existing`, returning the merged object.
///
/// Only called with `replace = false` semantics; full supersession is a
/// plain assignment at the call site and never reaches here.
pub fn merge_metadata(existing: &Value, incoming: &Value, strategy: &KindStrategy) -> Value {
    merge_values(existing, incoming, strategy, None)
}

fn merge_values(
    existing: &Value,
    incoming: &Value,
    strategy: &KindStrategy,
    field: Option<&str>,
) -> Value {
    match (existing, incoming) {
        (Value::Object(old), Value::Object(new)) => {
            let mut merged: Map<String, Value> = old.clone();
            for (key, new_value) in new {
                let next = match merged.get(key) {
                    Some(old_value) => merge_values(old_value, new_value, strategy, Some(key)),
                    None => new_value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (Value::Array(old), Value::Array(new)) => {
            let dedup_key = field.and_then(|f| strategy.dedup_key(f));
            Value::Array(union_arrays(old, new, dedup_key))
        }
        // Scalars and mismatched shapes: incoming wins.
        _ => incoming.clone(),
    }
}

/// Concatenate `old` then `new`, keeping the first occurrence of each
/// identity. Identity is `elem[key]` for object elements when a dedup key
/// is configured, otherwise the whole element.
fn union_arrays(old: &[Value], new: &[Value], dedup_key: Option<&str>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(old.len() + new.len());
    for elem in old.iter().chain(new.iter()) {
        let duplicate = out.iter().any(|seen| same_identity(seen, elem, dedup_key));
        if !duplicate {
            out.push(elem.clone());
        }
    }
    out
}

fn same_identity(a: &Value, b: &Value, dedup_key: Option<&str>) -> bool {
    if let Some(key) = dedup_key {
        if let (Value::Object(a), Value::Object(b)) = (a, b) {
            if let (Some(ka), Some(kb)) = (a.get(key), b.get(key)) {
                return ka == kb;
            }
        }
    }
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::Kind;
    use serde_json::json;

    #[test]
    fn scalar_fields_overwritten_by_incoming() {
        let strategy = Kind::Track.strategy();
        let merged = merge_metadata(
            &json!({"title": "A", "play_count": 4}),
            &json!({"play_count": 5}),
            strategy,
        );
        assert_eq!(merged, json!({"title": "A", "play_count": 5}));
    }

    #[test]
    fn nested_objects_merge_recursively() {
        let strategy = Kind::Track.strategy();
        let merged = merge_metadata(
            &json!({"artwork": {"small": "a.jpg", "large": "b.jpg"}}),
            &json!({"artwork": {"large": "c.jpg"}}),
            strategy,
        );
        assert_eq!(
            merged,
            json!({"artwork": {"small": "a.jpg", "large": "c.jpg"}})
        );
    }

    #[test]
    fn arrays_union_by_configured_key() {
        let strategy = Kind::Collection.strategy();
        let merged = merge_metadata(
            &json!({"track_ids": [{"track": 1, "time": 10}, {"track": 2, "time": 11}]}),
            &json!({"track_ids": [{"track": 2, "time": 99}, {"track": 3, "time": 12}]}),
            strategy,
        );
        // First occurrence wins for track 2; track 3 appended.
        assert_eq!(
            merged["track_ids"],
            json!([
                {"track": 1, "time": 10},
                {"track": 2, "time": 11},
                {"track": 3, "time": 12}
            ])
        );
    }

    #[test]
    fn arrays_without_key_dedup_by_value() {
        let strategy = Kind::Track.strategy();
        let merged = merge_metadata(
            &json!({"moods": ["calm", "bright"]}),
            &json!({"moods": ["bright", "dark"]}),
            strategy,
        );
        assert_eq!(merged["moods"], json!(["calm", "bright", "dark"]));
    }

    #[test]
    fn merge_is_idempotent() {
        let strategy = Kind::Collection.strategy();
        let base = json!({"playlist_name": "X", "track_ids": [{"track": 1, "time": 5}]});
        let once = merge_metadata(&json!({}), &base, strategy);
        let twice = merge_metadata(&once, &base, strategy);
        assert_eq!(once, twice);
    }
}

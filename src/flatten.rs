//! Conversion between nested records and the flat, dotted-key rows stored in
//! CSV files.
//!
//! A nested value such as
//!
//! ```text
//! {"block": {"pull_torque": 50, "reach_position": [100, 200]}}
//! ```
//!
//! flattens to
//!
//! ```text
//! {"block.pull_torque": 50, "block.reach_position.0": 100, "block.reach_position.1": 200}
//! ```
//!
//! and [unflatten] turns it back. Array elements are keyed by their index, and
//! an object whose keys are exactly `0..n` is rebuilt as an array.

use serde_json::{Map, Value};
use thiserror::Error;

/// The character that joins the path segments of a flattened key.
pub const SEPARATOR: char = '.';

/// Errors raised when a flat record cannot be nested again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlattenError {
    /// A key is used both as a leaf and as the prefix of a longer key, for
    /// example `a` and `a.b` in the same record.
    #[error("key '{0}' is both a value and a parent of other keys")]
    KeyConflict(String),

    /// A key has an empty path segment, for example `a..b`.
    #[error("key '{0}' has an empty segment")]
    EmptySegment(String),
}

/// Flattens a nested value into a map of dotted keys to scalar leaves.
///
/// Keys keep the order in which they appear in the nested value. A scalar at
/// the root is stored under the empty key.
pub fn flatten(value: &Value) -> Map<String, Value> {
    let mut flat = Map::new();
    flatten_into(&mut flat, String::new(), value);
    flat
}

fn flatten_into(flat: &mut Map<String, Value>, prefix: String, value: &Value) {
    match value {
        Value::Object(fields) => {
            for (key, child) in fields {
                flatten_into(flat, join(&prefix, key), child);
            }
        }
        Value::Array(elements) => {
            for (index, child) in elements.iter().enumerate() {
                flatten_into(flat, join(&prefix, &index.to_string()), child);
            }
        }
        leaf => {
            flat.insert(prefix, leaf.clone());
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}{SEPARATOR}{key}")
    }
}

/// Nests a flat record again, the inverse of [flatten].
pub fn unflatten(flat: &Map<String, Value>) -> Result<Value, FlattenError> {
    if let Some(root) = flat.get("") {
        return if flat.len() == 1 {
            Ok(root.clone())
        } else {
            Err(FlattenError::KeyConflict(String::new()))
        };
    }

    let mut root = Map::new();
    for (key, leaf) in flat {
        let segments: Vec<&str> = key.split(SEPARATOR).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(FlattenError::EmptySegment(key.clone()));
        }
        insert_path(&mut root, &segments, leaf.clone(), key)?;
    }

    Ok(rebuild_arrays(Value::Object(root)))
}

fn insert_path(
    node: &mut Map<String, Value>,
    segments: &[&str],
    leaf: Value,
    full_key: &str,
) -> Result<(), FlattenError> {
    let conflict = || FlattenError::KeyConflict(full_key.to_owned());
    match segments {
        [] => Err(conflict()),
        [last] => {
            if node.contains_key(*last) {
                return Err(conflict());
            }
            node.insert((*last).to_owned(), leaf);
            Ok(())
        }
        [first, rest @ ..] => {
            let child = node
                .entry((*first).to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            match child {
                Value::Object(child) => insert_path(child, rest, leaf, full_key),
                _ => Err(conflict()),
            }
        }
    }
}

/// Turns every object keyed exactly `0..n` into an array, bottom up.
fn rebuild_arrays(value: Value) -> Value {
    match value {
        Value::Object(fields) => {
            let fields: Map<String, Value> = fields
                .into_iter()
                .map(|(k, v)| (k, rebuild_arrays(v)))
                .collect();
            if is_index_keyed(&fields) {
                let mut indexed: Vec<(usize, Value)> = fields
                    .into_iter()
                    .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
                    .collect();
                indexed.sort_by_key(|(i, _)| *i);
                Value::Array(indexed.into_iter().map(|(_, v)| v).collect())
            } else {
                Value::Object(fields)
            }
        }
        other => other,
    }
}

fn is_index_keyed(fields: &Map<String, Value>) -> bool {
    if fields.is_empty() {
        return false;
    }
    let mut indices: Vec<usize> = Vec::with_capacity(fields.len());
    for key in fields.keys() {
        // Reject forms like "01" that would not survive a round trip
        match key.parse::<usize>() {
            Ok(i) if i.to_string() == *key => indices.push(i),
            _ => return false,
        }
    }
    indices.sort_unstable();
    indices.iter().enumerate().all(|(expected, &i)| expected == i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trial_record() -> Value {
        json!({
            "finished_trial_count": 3,
            "trial_aborted": false,
            "block": {
                "repeat_trial_count": 2,
                "pull_torque": 50,
                "lickport_reward_duration": 10,
                "reach_position": [100, 200]
            },
            "pull": 1690000000
        })
    }

    #[test]
    fn flattens_nested_objects_and_arrays() {
        let flat = flatten(&trial_record());
        let keys: Vec<&str> = flat.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "finished_trial_count",
                "trial_aborted",
                "block.repeat_trial_count",
                "block.pull_torque",
                "block.lickport_reward_duration",
                "block.reach_position.0",
                "block.reach_position.1",
                "pull",
            ]
        );
        assert_eq!(flat["block.reach_position.1"], json!(200));
    }

    #[test]
    fn unflatten_restores_nesting() {
        let record = trial_record();
        assert_eq!(unflatten(&flatten(&record)).unwrap(), record);
    }

    #[test]
    fn flatten_is_stable_through_unflatten() {
        let records = [
            trial_record(),
            json!({"a": [[1, 2], [3]], "b": {"c": {"d": "x"}}}),
            json!({"only": true}),
            json!({"list": [{"x": 1}, {"x": 2}]}),
        ];
        for record in records {
            let flat = flatten(&record);
            let again = flatten(&unflatten(&flat).unwrap());
            assert_eq!(again, flat);
        }
    }

    #[test]
    fn sparse_indices_stay_an_object() {
        let mut flat = Map::new();
        flat.insert("p.0".into(), json!(1));
        flat.insert("p.2".into(), json!(3));
        assert_eq!(unflatten(&flat).unwrap(), json!({"p": {"0": 1, "2": 3}}));
    }

    #[test]
    fn conflicting_keys_are_rejected() {
        let mut flat = Map::new();
        flat.insert("a".into(), json!(1));
        flat.insert("a.b".into(), json!(2));
        assert_eq!(
            unflatten(&flat),
            Err(FlattenError::KeyConflict("a.b".to_owned()))
        );
    }

    #[test]
    fn empty_segments_are_rejected() {
        let mut flat = Map::new();
        flat.insert("a..b".into(), json!(1));
        assert!(matches!(unflatten(&flat), Err(FlattenError::EmptySegment(_))));
    }
}

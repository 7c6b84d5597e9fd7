//! Canonical JSON serialization for deterministic hashing.
//!
//! Two templates that differ only in object key order must hash the
//! same, otherwise every reformat of the compiler output would force a
//! deployment.

use crate::error::DeployError;
use serde_json::Value;
use std::collections::BTreeMap;

/// Serialize to canonical JSON with sorted keys.
///
/// All object keys are sorted; array order is meaningful and kept.
pub fn to_canonical_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, DeployError> {
    let value = serde_json::to_value(value)
        .map_err(|e| DeployError::Manifest(format!("json error: {}", e)))?;
    serde_json::to_string(&sort_keys(value))
        .map_err(|e| DeployError::Manifest(format!("json error: {}", e)))
}

/// Recursively sort all object keys.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

//! Blob serialization and dependency placeholders.
//!
//! Task inputs and outputs cross the store as JSON blobs. An argument that is
//! a not-yet-computed future is stored as the tagged placeholder object
//! `{"$dep": "<task id>"}`; the worker substitutes the materialized result
//! just before execution. This keeps dependency tracking independent of the
//! value's shape.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::QueueError;

/// Key tagging a dependency placeholder object.
pub const DEP_KEY: &str = "$dep";

/// Serialize a value to a store blob.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, QueueError> {
    Ok(serde_json::to_vec(value)?)
}

/// Deserialize a store blob.
pub fn decode<T: DeserializeOwned>(blob: &[u8]) -> Result<T, QueueError> {
    Ok(serde_json::from_slice(blob)?)
}

/// Build the placeholder value referring to another task's future result.
pub fn dep_ref(id: &str) -> Value {
    serde_json::json!({ DEP_KEY: id })
}

/// If `value` is a dependency placeholder, return the referenced task id.
pub fn as_dep(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get(DEP_KEY)?.as_str()
}

/// Collect every task id referenced by placeholders anywhere in `value`.
pub fn collect_deps(value: &Value) -> Vec<String> {
    let mut deps = Vec::new();
    walk_deps(value, &mut deps);
    deps
}

fn walk_deps(value: &Value, deps: &mut Vec<String>) {
    if let Some(id) = as_dep(value) {
        if !deps.iter().any(|d| d == id) {
            deps.push(id.to_string());
        }
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                walk_deps(item, deps);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                walk_deps(item, deps);
            }
        }
        _ => {}
    }
}

/// Substitute every dependency placeholder in `value` using `lookup`.
///
/// `lookup` maps a task id to its decoded result value; it errors when the
/// referenced task is missing or not yet succeeded.
pub fn resolve_deps<F>(value: Value, lookup: &F) -> Result<Value, QueueError>
where
    F: Fn(&str) -> Result<Value, QueueError>,
{
    if let Some(id) = as_dep(&value) {
        return lookup(id);
    }
    match value {
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| resolve_deps(item, lookup))
                .collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key, resolve_deps(item, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other),
    }
}

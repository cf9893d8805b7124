//! # Structural Merge
//!
//! The resolver's `merge` strategy needs to combine a server value with an
//! op's payload without knowing the schema. That capability sits behind
//! [`StructuralMerge`]; [`JsonMerge`] is the implementation used for the
//! opaque JSON payloads the queue carries.
//!
//! ## Rules (`JsonMerge`)
//!
//! - both sides objects: shallow merge, op fields over server fields
//! - a field that is an array on both sides: set union, server order first
//! - any other field: the op's value wins
//! - anything that is not object-over-object: not mergeable

use serde_json::{Map, Value};

/// Result of a structural merge
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged(Value),
    /// The caller falls back to last-writer-wins
    NotMergeable,
}

/// Combines a server value with a client value
pub trait StructuralMerge: Send + Sync + 'static {
    fn merge(&self, server: &Value, client: &Value) -> MergeOutcome;
}

/// Shallow JSON object merge with array set-union
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMerge;

impl StructuralMerge for JsonMerge {
    fn merge(&self, server: &Value, client: &Value) -> MergeOutcome {
        match (server, client) {
            (Value::Object(server), Value::Object(client)) => {
                MergeOutcome::Merged(Value::Object(merge_objects(server, client)))
            }
            _ => MergeOutcome::NotMergeable,
        }
    }
}

fn merge_objects(server: &Map<String, Value>, client: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = server.clone();
    for (key, incoming) in client {
        let value = match (merged.get(key), incoming) {
            (Some(Value::Array(existing)), Value::Array(added)) => {
                Value::Array(union(existing, added))
            }
            _ => incoming.clone(),
        };
        merged.insert(key.clone(), value);
    }
    merged
}

fn union(existing: &[Value], added: &[Value]) -> Vec<Value> {
    let mut out = existing.to_vec();
    for item in added {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

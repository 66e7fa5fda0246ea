//! State map helpers: reserved keys, deep merge, zero-value detection.

use indexmap::IndexMap;
use serde_json::Value;

/// Want state and parameters. Insertion order is preserved so snapshots and
/// history entries serialize the way users wrote them.
pub type StateMap = IndexMap<String, Value>;

/// Reserved fields maintained by the runtime.
pub const ACTION_BY_AGENT: &str = "action_by_agent";
pub const ACHIEVING_PERCENTAGE: &str = "achieving_percentage";
pub const COMPLETED: &str = "completed";
pub const FINAL_RESULT: &str = "final_result";

/// Keys starting with `_` are internal and excluded from history entries.
pub fn is_internal_key(key: &str) -> bool {
    key.starts_with('_')
}

/// Recursive merge: objects merge key-wise with `src` winning on conflicts,
/// anything else overwrites.
pub fn deep_merge_value(dest: &mut Value, src: Value) {
    match (dest, src) {
        (Value::Object(dest_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dest_map.get_mut(&k) {
                    Some(existing) => deep_merge_value(existing, v),
                    None => {
                        dest_map.insert(k, v);
                    }
                }
            }
        }
        (dest, src) => *dest = src,
    }
}

/// Merge `updates` into `map`, deep-merging values key by key.
pub fn merge_into(map: &mut StateMap, updates: StateMap) {
    for (k, v) in updates {
        match map.get_mut(&k) {
            Some(existing) => deep_merge_value(existing, v),
            None => {
                map.insert(k, v);
            }
        }
    }
}

/// Zero values are skipped when auto-populating `final_result`.
pub fn is_zero_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().map(|f| f == 0.0).unwrap_or(false),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

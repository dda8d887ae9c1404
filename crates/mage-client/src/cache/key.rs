//! Canonical cache keys.
//!
//! An index is any JSON value. Two indices that are structurally equal map to
//! the same key no matter how their objects were built: object keys are
//! emitted in sorted order at every depth, arrays keep their order, and
//! scalars use their JSON spelling (so `"5"` and `5` stay distinct).

use serde_json::Value;
use std::fmt;

/// Deterministic string identity of an index value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Canonicalize an index value.
    pub fn from_index(index: &Value) -> Self {
        let mut out = String::new();
        write_canonical(index, &mut out);
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Value> for CacheKey {
    fn from(index: &Value) -> Self {
        CacheKey::from_index(index)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

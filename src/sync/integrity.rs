use std::fmt::Write;
use serde_json::{Map, Value};
use tracing::warn;
use crate::sync::diff::Patch;

/// Top-level keys that are node-local or control-plane and never hashed.
const TRANSIENT_KEYS: &[&str] = &[
    "node",
    "nodes",
    "meta",
    "user",
    "users",
    "permissions",
    "connections",
    "tokens",
    "command",
    "commandArgs",
    "commandDescription",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    Verified,
    /// The sender did not attach a hash.
    Unverifiable,
    Diverged { expected: u32, actual: u32 },
}

impl Integrity {
    pub fn is_diverged(&self) -> bool {
        matches!(self, Integrity::Diverged { .. })
    }
}

/// The document as it is hashed: transient keys and `state.last` removed,
/// nulls and empty objects stripped.
pub fn clean_for_hash(doc: &Value) -> Value {
    let Value::Object(map) = doc else {
        return strip_empty(doc).unwrap_or(Value::Null);
    };
    let mut out = Map::new();
    for (key, value) in map {
        if TRANSIENT_KEYS.contains(&key.as_str()) {
            continue;
        }
        let value = if key == "state" {
            match value {
                Value::Object(state) => {
                    let mut state = state.clone();
                    state.remove("last");
                    Value::Object(state)
                }
                other => other.clone(),
            }
        } else {
            value.clone()
        };
        if let Some(cleaned) = strip_empty(&value) {
            out.insert(key.clone(), cleaned);
        }
    }
    Value::Object(out)
}

fn strip_empty(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let stripped: Map<String, Value> = map
                .iter()
                .filter_map(|(k, v)| strip_empty(v).map(|v| (k.clone(), v)))
                .collect();
            (!stripped.is_empty()).then_some(Value::Object(stripped))
        }
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .map(|item| strip_empty(item).unwrap_or(Value::Null))
                .collect(),
        )),
        other => Some(other.clone()),
    }
}

/// Compact JSON with object keys sorted.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
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
                let _ = write!(out, "{}:", Value::String(key.clone()));
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
        leaf => {
            let _ = write!(out, "{}", leaf);
        }
    }
}

/// djb2 over UTF-16 code units, xor variant, wrapping at 32 bits.
pub fn djb2(text: &str) -> u32 {
    text.encode_utf16()
        .fold(5381u32, |hash, unit| hash.wrapping_mul(33) ^ u32::from(unit))
}

pub fn fingerprint(doc: &Value) -> u32 {
    djb2(&canonical_json(&clean_for_hash(doc)))
}

/// Hash of only the base values `patch` touches (`meta.hashDiff`).
pub fn scoped_fingerprint(base: &Value, patch: &Patch) -> u32 {
    fingerprint(&patch.base_values(base))
}

/// Compares the receiver's snapshot against the base the sender assumed.
/// A scoped `hash_diff` is preferred over the whole-document `hash`.
pub fn verify(stored: &Value, patch: &Patch, hash: Option<u32>, hash_diff: Option<u32>) -> Integrity {
    let (expected, actual) = match (hash_diff, hash) {
        (Some(expected), _) => (expected, scoped_fingerprint(stored, patch)),
        (None, Some(expected)) => (expected, fingerprint(stored)),
        (None, None) => return Integrity::Unverifiable,
    };
    if expected == actual {
        Integrity::Verified
    } else {
        warn!(expected, actual, "replica diverged from the diff's base, applying anyway");
        Integrity::Diverged { expected, actual }
    }
}

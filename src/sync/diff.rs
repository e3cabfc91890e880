use std::collections::BTreeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use crate::error::{SyncError, SyncResult};

/// One key's change inside a [`Patch`].
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    /// Replace the value wholesale. Arrays and scalars always travel as `Set`.
    Set(Value),
    /// Remove the key. Encoded as `null` on the wire.
    Delete,
    /// Recurse into an object.
    Merge(Patch),
}

/// A structural delta between two documents.
///
/// Patches are applied functionally: [`Patch::apply`] never mutates its input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    entries: BTreeMap<String, PatchOp>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &str) -> Option<&PatchOp> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PatchOp)> {
        self.entries.iter().map(|(k, op)| (k.as_str(), op))
    }

    pub fn insert(&mut self, key: impl Into<String>, op: PatchOp) {
        self.entries.insert(key.into(), op);
    }

    pub fn remove(&mut self, key: &str) -> Option<PatchOp> {
        self.entries.remove(key)
    }

    /// Sets `path` (dotted, e.g. `"input.promptText"`). A `null` value
    /// deletes instead.
    pub fn set(mut self, path: &str, value: Value) -> Self {
        let op = if value.is_null() { PatchOp::Delete } else { PatchOp::Set(value) };
        let segments: Vec<&str> = path.split('.').collect();
        self.put(&segments, op);
        self
    }

    pub fn delete(mut self, path: &str) -> Self {
        let segments: Vec<&str> = path.split('.').collect();
        self.put(&segments, PatchOp::Delete);
        self
    }

    fn put(&mut self, segments: &[&str], op: PatchOp) {
        match segments {
            [] => {}
            [leaf] => {
                self.entries.insert(leaf.to_string(), op);
            }
            [head, rest @ ..] => {
                let slot = self
                    .entries
                    .entry(head.to_string())
                    .or_insert_with(|| PatchOp::Merge(Patch::new()));
                match slot {
                    PatchOp::Merge(inner) => inner.put(rest, op),
                    PatchOp::Set(value) => {
                        let mut nested = Patch::new();
                        nested.put(rest, op);
                        *value = nested.apply(value);
                    }
                    PatchOp::Delete => {
                        let mut nested = Patch::new();
                        nested.put(rest, op);
                        *slot = PatchOp::Set(nested.apply_nested(None));
                    }
                }
            }
        }
    }

    /// Decodes a wire diff: `null` is a tombstone, non-empty objects recurse,
    /// anything else (`{}` included) is a wholesale replacement.
    pub fn from_value(value: &Value) -> SyncResult<Self> {
        match value {
            Value::Object(map) => Ok(Self::from_map(map)),
            other => Err(SyncError::InvalidPatch(format!(
                "expected an object, got {}",
                type_name(other)
            ))),
        }
    }

    fn from_map(map: &Map<String, Value>) -> Self {
        let entries = map
            .iter()
            .map(|(key, value)| {
                let op = match value {
                    Value::Null => PatchOp::Delete,
                    Value::Object(inner) if !inner.is_empty() => PatchOp::Merge(Self::from_map(inner)),
                    other => PatchOp::Set(other.clone()),
                };
                (key.clone(), op)
            })
            .collect();
        Self { entries }
    }

    pub fn to_value(&self) -> Value {
        let map = self
            .entries
            .iter()
            .map(|(key, op)| {
                let value = match op {
                    PatchOp::Set(v) => v.clone(),
                    PatchOp::Delete => Value::Null,
                    PatchOp::Merge(inner) => inner.to_value(),
                };
                (key.clone(), value)
            })
            .collect();
        Value::Object(map)
    }

    /// Returns `base` with this patch applied. A non-object base is treated
    /// as an empty object; an empty patch returns `base` unchanged.
    pub fn apply(&self, base: &Value) -> Value {
        if self.is_empty() {
            return base.clone();
        }
        let mut out = match base {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for (key, op) in &self.entries {
            match op {
                PatchOp::Delete => {
                    out.remove(key);
                }
                PatchOp::Set(value) => {
                    out.insert(key.clone(), value.clone());
                }
                PatchOp::Merge(inner) => {
                    let merged = inner.apply_nested(out.get(key));
                    out.insert(key.clone(), merged);
                }
            }
        }
        Value::Object(out)
    }

    /// Merges into `base` as a nested value: anything but an object is
    /// replaced by one, even when this patch is empty.
    fn apply_nested(&self, base: Option<&Value>) -> Value {
        match base {
            Some(current @ Value::Object(_)) => self.apply(current),
            _ => self.apply(&Value::Object(Map::new())),
        }
    }

    /// Sequential composition: `a.compose(&b).apply(x) == b.apply(&a.apply(x))`.
    /// On colliding keys the later op wins.
    pub fn compose(&self, next: &Patch) -> Patch {
        let mut entries = self.entries.clone();
        for (key, later) in &next.entries {
            let combined = match (entries.remove(key), later) {
                (None, op) => op.clone(),
                (Some(_), PatchOp::Set(v)) => PatchOp::Set(v.clone()),
                (Some(_), PatchOp::Delete) => PatchOp::Delete,
                (Some(PatchOp::Set(v)), PatchOp::Merge(inner)) => PatchOp::Set(inner.apply_nested(Some(&v))),
                (Some(PatchOp::Delete), PatchOp::Merge(inner)) => PatchOp::Set(inner.apply_nested(None)),
                (Some(PatchOp::Merge(first)), PatchOp::Merge(inner)) => {
                    PatchOp::Merge(first.compose(inner))
                }
            };
            entries.insert(key.clone(), combined);
        }
        Patch { entries }
    }

    /// Copy of this patch without the top-level `key`.
    pub fn without(&self, key: &str) -> Patch {
        let mut out = self.clone();
        out.entries.remove(key);
        out
    }

    /// Copy of this patch restricted to the given top-level keys.
    pub fn only(&self, keys: &[&str]) -> Patch {
        let entries = self
            .entries
            .iter()
            .filter(|(k, _)| keys.contains(&k.as_str()))
            .map(|(k, op)| (k.clone(), op.clone()))
            .collect();
        Patch { entries }
    }

    /// Each top-level key this patch targets, carried as its full value in
    /// `doc` (or a tombstone when `doc` lacks it).
    pub fn wholesale(&self, doc: &Value) -> Patch {
        let entries = self
            .entries
            .keys()
            .map(|key| {
                let op = match doc.get(key) {
                    Some(value) if !value.is_null() => PatchOp::Set(value.clone()),
                    _ => PatchOp::Delete,
                };
                (key.clone(), op)
            })
            .collect();
        Patch { entries }
    }

    /// Drops every op that would leave `doc` unchanged.
    pub fn prune_against(&self, doc: &Value) -> Patch {
        let empty = Map::new();
        let map = doc.as_object().unwrap_or(&empty);
        let mut entries = BTreeMap::new();
        for (key, op) in &self.entries {
            let current = map.get(key);
            let kept = match (op, current) {
                (PatchOp::Delete, None) => None,
                (PatchOp::Set(v), Some(cur)) if v == cur => None,
                (PatchOp::Merge(inner), Some(cur @ Value::Object(_))) => {
                    let pruned = inner.prune_against(cur);
                    (!pruned.is_empty()).then_some(PatchOp::Merge(pruned))
                }
                (op, _) => Some(op.clone()),
            };
            if let Some(op) = kept {
                entries.insert(key.clone(), op);
            }
        }
        Patch { entries }
    }

    /// The values in `doc` that this patch would overwrite or delete.
    pub fn base_values(&self, doc: &Value) -> Value {
        let empty = Map::new();
        let map = doc.as_object().unwrap_or(&empty);
        let mut out = Map::new();
        for (key, op) in &self.entries {
            let Some(current) = map.get(key) else { continue };
            match (op, current) {
                (PatchOp::Merge(inner), Value::Object(_)) => {
                    out.insert(key.clone(), inner.base_values(current));
                }
                _ => {
                    out.insert(key.clone(), current.clone());
                }
            }
        }
        Value::Object(out)
    }

    /// Whether the dotted `path` is written (or under a written key).
    pub fn touches(&self, path: &str) -> bool {
        let mut cursor = self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            match cursor.entries.get(segment) {
                None => return false,
                Some(PatchOp::Merge(inner)) if segments.peek().is_some() => cursor = inner,
                Some(_) => return true,
            }
        }
        false
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl Serialize for Patch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Patch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Patch::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Minimal recursive difference turning `a` into `b`.
///
/// Keys missing from `b` become tombstones, objects recurse and everything
/// else (arrays included) is replaced wholesale. `null` and absent are the
/// same thing.
pub fn diff(a: &Value, b: &Value) -> Patch {
    let empty = Map::new();
    let before = a.as_object().unwrap_or(&empty);
    let after = b.as_object().unwrap_or(&empty);
    let mut patch = Patch::new();

    for (key, old) in before {
        if !old.is_null() && !after.contains_key(key) {
            patch.entries.insert(key.clone(), PatchOp::Delete);
        }
    }

    for (key, new) in after {
        match (before.get(key), new) {
            (Some(old), new) if old == new => {}
            (Some(old @ Value::Object(_)), Value::Object(_)) => {
                let inner = diff(old, new);
                if !inner.is_empty() {
                    patch.entries.insert(key.clone(), PatchOp::Merge(inner));
                }
            }
            (Some(_), Value::Null) => {
                patch.entries.insert(key.clone(), PatchOp::Delete);
            }
            (None, Value::Null) => {}
            (_, new) => {
                patch.entries.insert(key.clone(), PatchOp::Set(new.clone()));
            }
        }
    }
    patch
}

/// `patch` applied to `base`.
pub fn merge(base: &Value, patch: &Patch) -> Value {
    patch.apply(base)
}

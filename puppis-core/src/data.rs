//! ResourceData - the typed facade handed to every CRUD callback
//!
//! Reads see a layered view of the instance: buffered writes over the
//! diff's new values over prior state, with schema defaults and zero
//! values underneath. Writes are buffered in memory; the caller
//! materializes them into a new state after the callback succeeds.

use std::collections::{BTreeMap, BTreeSet};

use crate::differ::InstanceDiff;
use crate::flatmap::{self, PathTarget};
use crate::resource::{ResourceState, Value};
use crate::schema::{AttributeSchema, CoercionError, SchemaMap, SchemaType};

/// Per-callback handle over one resource instance. Not shared: each CRUD
/// invocation gets its own.
#[derive(Debug)]
pub struct ResourceData<'a> {
    schema: &'a SchemaMap,
    state: &'a ResourceState,
    diff: Option<&'a InstanceDiff>,
    /// Buffered writes, in flat form.
    writes: BTreeMap<String, String>,
    /// Paths whose state/diff layers a write has replaced wholesale.
    cleared: BTreeSet<String>,
    id: String,
}

impl<'a> ResourceData<'a> {
    pub fn new(
        schema: &'a SchemaMap,
        state: &'a ResourceState,
        diff: Option<&'a InstanceDiff>,
    ) -> Self {
        Self {
            schema,
            state,
            diff,
            writes: BTreeMap::new(),
            cleared: BTreeSet::new(),
            id: state.id.clone(),
        }
    }

    /// The instance identity. Empty means not created (or destroyed).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    /// Effective value at `key` (dotted sub-paths allowed), layered as
    /// pending writes > diff > state > default > zero value. Unresolvable
    /// paths read as `Null`.
    pub fn get(&self, key: &str) -> Value {
        let Some(target) = flatmap::resolve_path(self.schema, key) else {
            return Value::Null;
        };
        let flat = self.effective_flat(root_of(key));

        match target {
            PathTarget::Attribute(attr) => match flatmap::read_attribute(&flat, key, attr) {
                Some(v) => v,
                None => attr
                    .default
                    .clone()
                    .unwrap_or_else(|| zero_value(attr.attr_type)),
            },
            PathTarget::Object(fields) => {
                flatmap::read_object(&flat, key, fields).unwrap_or(Value::Null)
            }
            PathTarget::Count(_) => Value::Int(
                flat.get(key)
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0),
            ),
        }
    }

    /// Like [`get`](Self::get), plus whether the value was actually present
    /// in writes, diff, or state - distinguishing "unset" from "set to its
    /// zero value".
    pub fn get_ok(&self, key: &str) -> (Value, bool) {
        let flat = self.effective_flat(root_of(key));
        let prefix = format!("{key}.");
        let exists = flat
            .keys()
            .any(|k| k == key || k.starts_with(&prefix));
        (self.get(key), exists)
    }

    /// The canonical input pair for update callbacks: `(state value,
    /// effective value)`.
    pub fn get_change(&self, key: &str) -> (Value, Value) {
        let old = match flatmap::resolve_path(self.schema, key) {
            Some(PathTarget::Attribute(attr)) => {
                let flat = state_subtree(self.state, root_of(key));
                flatmap::read_attribute(&flat, key, attr)
                    .unwrap_or_else(|| zero_value(attr.attr_type))
            }
            Some(PathTarget::Object(fields)) => {
                let flat = state_subtree(self.state, root_of(key));
                flatmap::read_object(&flat, key, fields).unwrap_or(Value::Null)
            }
            Some(PathTarget::Count(_)) => Value::Int(
                self.state
                    .attributes
                    .get(key)
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0),
            ),
            None => Value::Null,
        };
        (old, self.get(key))
    }

    /// Whether the diff touches `key` or anything nested under it.
    pub fn has_change(&self, key: &str) -> bool {
        self.diff.is_some_and(|d| d.has_change_under(key))
    }

    /// Record a pending write. The value is coerced through the declared
    /// schema; a shape mismatch fails without touching the buffer.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<(), CoercionError> {
        let value = value.into();
        let attr: &AttributeSchema = match flatmap::resolve_path(self.schema, key) {
            Some(PathTarget::Attribute(attr)) => attr,
            _ => {
                return Err(CoercionError {
                    path: key.to_string(),
                    expected: "settable attribute path".to_string(),
                    got: value.type_name().to_string(),
                });
            }
        };

        let mut buffered = BTreeMap::new();
        if !value.is_null() {
            flatmap::flatten_attribute(&mut buffered, key, attr, &value)?;
        }

        let prefix = format!("{key}.");
        self.writes.retain(|k, _| k != key && !k.starts_with(&prefix));
        self.cleared.insert(key.to_string());
        self.writes.extend(buffered);
        Ok(())
    }

    /// Materialize id plus layered attributes into a new state. Only
    /// schema-declared attributes survive.
    pub fn into_state(self, type_name: &str) -> ResourceState {
        let mut attributes = BTreeMap::new();
        for (name, _) in self.schema.iter() {
            attributes.extend(self.effective_flat(name));
        }
        ResourceState {
            id: self.id,
            type_name: type_name.to_string(),
            attributes,
        }
    }

    /// The layered flat view of one top-level attribute subtree.
    fn effective_flat(&self, root: &str) -> BTreeMap<String, String> {
        let prefix = format!("{root}.");
        let in_root = |k: &str| k == root || k.starts_with(&prefix);
        let cleared = |k: &str| {
            self.cleared
                .iter()
                .any(|c| k == c || k.starts_with(&format!("{c}.")))
        };

        let mut flat = BTreeMap::new();
        for (k, v) in &self.state.attributes {
            if in_root(k) && !cleared(k) {
                flat.insert(k.clone(), v.clone());
            }
        }
        if let Some(diff) = self.diff {
            for (k, a) in &diff.attributes {
                if !in_root(k) || cleared(k) {
                    continue;
                }
                if a.new_removed {
                    flat.remove(k);
                } else if !a.new_computed {
                    flat.insert(k.clone(), a.new.clone());
                }
            }
        }
        for (k, v) in &self.writes {
            if in_root(k) {
                flat.insert(k.clone(), v.clone());
            }
        }
        flat
    }
}

fn root_of(key: &str) -> &str {
    key.split('.').next().unwrap_or(key)
}

fn state_subtree(state: &ResourceState, root: &str) -> BTreeMap<String, String> {
    let prefix = format!("{root}.");
    state
        .attributes
        .iter()
        .filter(|(k, _)| k.as_str() == root || k.starts_with(&prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn zero_value(t: SchemaType) -> Value {
    match t {
        SchemaType::Bool => Value::Bool(false),
        SchemaType::Int => Value::Int(0),
        SchemaType::String => Value::String(String::new()),
        SchemaType::List | SchemaType::Set => Value::List(Vec::new()),
        SchemaType::Map => Value::Map(BTreeMap::new()),
    }
}

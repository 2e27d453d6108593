//! Differ - compare prior state with desired configuration
//!
//! Produces an [`InstanceDiff`]: one entry per changed flat attribute path.
//! Both sides are compared in flat form, so containers diff structurally -
//! lists by position, sets by element hash, maps by key.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::flatmap::{flatten_attribute, primitive_to_flat};
use crate::resource::{ResourceConfig, ResourceState, Value};
use crate::schema::{AttributeSchema, CoercionError, SchemaMap};

/// Change to a single flat attribute path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDiff {
    pub old: String,
    pub new: String,
    /// The new value is not known yet and will be filled in post-apply.
    pub new_computed: bool,
    /// The attribute is being removed.
    pub new_removed: bool,
    /// This change destroys and recreates the instance.
    pub requires_new: bool,
    /// Masked when the diff is rendered.
    pub sensitive: bool,
}

/// The full set of changes for one resource instance. Empty means
/// "no change".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDiff {
    pub attributes: BTreeMap<String, AttributeDiff>,
    /// Marker diff: the instance is to be destroyed.
    pub destroy: bool,
}

impl InstanceDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_destroy() -> Self {
        Self {
            attributes: BTreeMap::new(),
            destroy: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.destroy && self.attributes.is_empty()
    }

    /// Whether applying this diff means destroying the current instance.
    pub fn requires_new(&self) -> bool {
        self.destroy || self.attributes.values().any(|a| a.requires_new)
    }

    pub fn get(&self, path: &str) -> Option<&AttributeDiff> {
        self.attributes.get(path)
    }

    /// True iff the diff touches `path` itself or anything nested under it.
    pub fn has_change_under(&self, path: &str) -> bool {
        let prefix = format!("{path}.");
        self.attributes
            .keys()
            .any(|k| k == path || k.starts_with(&prefix))
    }
}

impl fmt::Display for InstanceDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.destroy {
            writeln!(f, "  (destroy)")?;
        }
        for (path, a) in &self.attributes {
            let old = if a.sensitive && !a.old.is_empty() {
                "(sensitive)"
            } else {
                a.old.as_str()
            };
            let new = if a.new_computed {
                "<computed>".to_string()
            } else if a.sensitive && !a.new.is_empty() {
                "\"(sensitive)\"".to_string()
            } else {
                format!("{:?}", a.new)
            };
            let suffix = if a.requires_new {
                " (forces new resource)"
            } else {
                ""
            };
            writeln!(f, "  {path}: {old:?} => {new}{suffix}")?;
        }
        Ok(())
    }
}

/// Compute the structural diff between `state` and `config` under `schema`.
///
/// For each declared attribute the old side comes from the flat state, the
/// new side from the flattened configuration (with defaults applied and
/// state normalizers run on both sides). Equal sides emit nothing.
///
/// When some entry forces a new instance, the result is re-derived against
/// an empty state: the replacement's create must carry every configured
/// attribute, and the computed ones come back fresh (`new_computed`). The
/// real old values are restored on the entries for context.
pub fn diff(
    schema: &SchemaMap,
    state: &ResourceState,
    config: &ResourceConfig,
) -> Result<InstanceDiff, CoercionError> {
    let mut diff = diff_once(schema, &state.attributes, config)?;

    if state.exists() && diff.attributes.values().any(|a| a.requires_new) {
        let empty = BTreeMap::new();
        let mut rediff = diff_once(schema, &empty, config)?;
        for (key, entry) in rediff.attributes.iter_mut() {
            if let Some(old) = state.attributes.get(key) {
                entry.old = old.clone();
            }
        }
        // Replacement markers must survive even for entries the empty-state
        // pass does not re-emit (a removed force-new attribute).
        for (key, entry) in diff.attributes.iter().filter(|(_, e)| e.requires_new) {
            match rediff.attributes.get_mut(key) {
                Some(e) => e.requires_new = true,
                None => {
                    rediff.attributes.insert(key.clone(), entry.clone());
                }
            }
        }
        diff = rediff;
    }

    trace!(
        resource_type = %state.type_name,
        changes = diff.attributes.len(),
        "computed instance diff"
    );
    Ok(diff)
}

fn diff_once(
    schema: &SchemaMap,
    old_flat: &BTreeMap<String, String>,
    config: &ResourceConfig,
) -> Result<InstanceDiff, CoercionError> {
    let mut diff = InstanceDiff::new();
    for (name, attr) in schema.iter() {
        if attr.attr_type.is_primitive() {
            diff_primitive(&mut diff, name, attr, old_flat, config)?;
        } else {
            diff_container(&mut diff, name, attr, old_flat, config)?;
        }
    }
    Ok(diff)
}

fn diff_primitive(
    diff: &mut InstanceDiff,
    name: &str,
    attr: &AttributeSchema,
    old_flat: &BTreeMap<String, String>,
    config: &ResourceConfig,
) -> Result<(), CoercionError> {
    let old_exists = old_flat.contains_key(name);
    let old = attr.normalize_flat(old_flat.get(name).cloned().unwrap_or_default());

    let cfg = config.get(name);
    if cfg.is_some_and(Value::contains_unknown) {
        diff.attributes.insert(
            name.to_string(),
            AttributeDiff {
                old,
                new_computed: true,
                sensitive: attr.sensitive,
                ..Default::default()
            },
        );
        return Ok(());
    }

    let (new, new_set) = match cfg {
        None | Some(Value::Null) => {
            if let Some(default) = &attr.default {
                let coerced = attr.attr_type.coerce_primitive(default).ok_or_else(|| {
                    CoercionError {
                        path: name.to_string(),
                        expected: attr.attr_type.type_name().to_string(),
                        got: default.type_name().to_string(),
                    }
                })?;
                (attr.normalize_flat(primitive_to_flat(&coerced)), true)
            } else if attr.computed {
                // Provider-supplied: keep what we have, or ask for a value.
                if old.is_empty() {
                    diff.attributes.insert(
                        name.to_string(),
                        AttributeDiff {
                            new_computed: true,
                            sensitive: attr.sensitive,
                            ..Default::default()
                        },
                    );
                }
                return Ok(());
            } else {
                (String::new(), false)
            }
        }
        Some(v) => {
            let coerced =
                attr.attr_type
                    .coerce_primitive(v)
                    .ok_or_else(|| CoercionError {
                        path: name.to_string(),
                        expected: attr.attr_type.type_name().to_string(),
                        got: v.type_name().to_string(),
                    })?;
            (attr.normalize_flat(primitive_to_flat(&coerced)), true)
        }
    };

    if old == new {
        return Ok(());
    }
    // A zero-valued config against an attribute never present in state is
    // not a change, unless the attribute is required.
    if !old_exists && !attr.required && attr.attr_type.is_zero_flat(&new) {
        return Ok(());
    }

    diff.attributes.insert(
        name.to_string(),
        AttributeDiff {
            old,
            new,
            new_removed: !new_set && old_exists,
            requires_new: attr.force_new,
            sensitive: attr.sensitive,
            ..Default::default()
        },
    );
    Ok(())
}

fn diff_container(
    diff: &mut InstanceDiff,
    name: &str,
    attr: &AttributeSchema,
    old_flat: &BTreeMap<String, String>,
    config: &ResourceConfig,
) -> Result<(), CoercionError> {
    let suffix = attr.attr_type.count_suffix().unwrap_or("#");
    let count_key = format!("{name}.{suffix}");
    let old_sub = collect_subtree(old_flat, name);

    let cfg = config.get(name);
    if cfg.is_some_and(Value::contains_unknown) {
        let old_count = old_sub.get(&count_key).cloned().unwrap_or_default();
        diff.attributes.insert(
            count_key,
            AttributeDiff {
                old: old_count,
                new_computed: true,
                sensitive: attr.sensitive,
                ..Default::default()
            },
        );
        return Ok(());
    }

    let mut new_sub = BTreeMap::new();
    match cfg {
        None | Some(Value::Null) => {
            if let Some(default) = &attr.default {
                flatten_attribute(&mut new_sub, name, attr, default)?;
            } else if attr.computed {
                if old_sub.is_empty() {
                    diff.attributes.insert(
                        count_key,
                        AttributeDiff {
                            new_computed: true,
                            sensitive: attr.sensitive,
                            ..Default::default()
                        },
                    );
                }
                return Ok(());
            }
        }
        Some(v) => flatten_attribute(&mut new_sub, name, attr, v)?,
    }

    if old_sub.is_empty() {
        // An explicitly empty container against an absent one is not a
        // change, unless the attribute is required.
        let only_zero_count = new_sub.len() == 1
            && new_sub.get(&count_key).map(String::as_str) == Some("0");
        if !attr.required && (new_sub.is_empty() || only_zero_count) {
            return Ok(());
        }
    }

    let keys: BTreeSet<&String> = old_sub.keys().chain(new_sub.keys()).collect();
    for key in keys {
        match (old_sub.get(key), new_sub.get(key)) {
            (Some(o), Some(n)) if o == n => {}
            (o, n) => {
                diff.attributes.insert(
                    key.clone(),
                    AttributeDiff {
                        old: o.cloned().unwrap_or_default(),
                        new: n.cloned().unwrap_or_default(),
                        new_removed: n.is_none(),
                        requires_new: attr.force_new,
                        sensitive: attr.sensitive,
                        ..Default::default()
                    },
                );
            }
        }
    }
    Ok(())
}

fn collect_subtree(flat: &BTreeMap<String, String>, root: &str) -> BTreeMap<String, String> {
    let prefix = format!("{root}.");
    flat.iter()
        .filter(|(k, _)| k.starts_with(&prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeSchema, Elem, SchemaType};

    fn app_schema() -> SchemaMap {
        SchemaMap::new()
            .attribute(AttributeSchema::new("name", SchemaType::String).required())
            .attribute(
                AttributeSchema::new("region", SchemaType::String)
                    .optional()
                    .with_default("us-east"),
            )
            .attribute(AttributeSchema::new("id", SchemaType::String).computed())
    }

    fn ingress_schema(hash: Option<crate::schema::SetHashFunc>) -> SchemaMap {
        let mut attr = AttributeSchema::new("ingress", SchemaType::Set)
            .optional()
            .with_elem(Elem::Object(
                SchemaMap::new()
                    .attribute(AttributeSchema::new("port", SchemaType::Int).required())
                    .attribute(AttributeSchema::new("cidr", SchemaType::String).optional()),
            ));
        if let Some(h) = hash {
            attr = attr.with_set_hash(h);
        }
        SchemaMap::new().attribute(attr)
    }

    fn by_port(v: &Value) -> u64 {
        match v {
            Value::Map(m) => match m.get("port") {
                Some(Value::Int(p)) => *p as u64,
                _ => 0,
            },
            _ => 0,
        }
    }

    #[test]
    fn create_applies_defaults_and_marks_computed() {
        let schema = app_schema();
        let state = ResourceState::new("app");
        let config = ResourceConfig::new().with_attribute("name", "app");

        let d = diff(&schema, &state, &config).unwrap();

        assert_eq!(d.attributes.len(), 3);
        let name = d.get("name").unwrap();
        assert_eq!((name.old.as_str(), name.new.as_str()), ("", "app"));
        let region = d.get("region").unwrap();
        assert_eq!((region.old.as_str(), region.new.as_str()), ("", "us-east"));
        assert!(d.get("id").unwrap().new_computed);
    }

    #[test]
    fn matching_state_yields_an_empty_diff() {
        let schema = app_schema();
        let state = ResourceState::new("app")
            .with_id("app-1")
            .with_attribute("name", "app")
            .with_attribute("region", "us-east")
            .with_attribute("id", "app-1");
        let config = ResourceConfig::new().with_attribute("name", "app");

        let d = diff(&schema, &state, &config).unwrap();
        assert!(d.is_empty(), "expected empty diff, got: {d}");
    }

    #[test]
    fn force_new_change_marks_computed_attributes() {
        let schema = SchemaMap::new()
            .attribute(AttributeSchema::new("name", SchemaType::String).required())
            .attribute(
                AttributeSchema::new("stack", SchemaType::String)
                    .optional()
                    .force_new(),
            )
            .attribute(AttributeSchema::new("id", SchemaType::String).computed());
        let state = ResourceState::new("app")
            .with_id("a1")
            .with_attribute("name", "app")
            .with_attribute("stack", "cedar-14")
            .with_attribute("id", "a1");
        let config = ResourceConfig::new()
            .with_attribute("name", "app")
            .with_attribute("stack", "heroku-18");

        let d = diff(&schema, &state, &config).unwrap();

        let stack = d.get("stack").unwrap();
        assert!(stack.requires_new);
        assert_eq!(stack.new, "heroku-18");
        let id = d.get("id").unwrap();
        assert!(id.new_computed, "computed attrs refresh on replacement");
        assert!(d.requires_new());
    }

    #[test]
    fn optional_computed_force_new_cleared_recomputes_silently() {
        // Clearing an optional+computed+force-new attribute from config is
        // not a positive signal: the provider keeps (or recomputes) the
        // value, and no replacement happens.
        let schema = SchemaMap::new()
            .attribute(AttributeSchema::new("name", SchemaType::String).required())
            .attribute(
                AttributeSchema::new("fingerprint", SchemaType::String)
                    .optional()
                    .computed()
                    .force_new(),
            );
        let state = ResourceState::new("key")
            .with_id("k1")
            .with_attribute("name", "deploy")
            .with_attribute("fingerprint", "ab:cd");
        let config = ResourceConfig::new().with_attribute("name", "deploy");

        let d = diff(&schema, &state, &config).unwrap();
        assert!(d.is_empty(), "got: {d}");
    }

    #[test]
    fn optional_computed_force_new_pinned_to_a_new_value_replaces() {
        let schema = SchemaMap::new()
            .attribute(AttributeSchema::new("name", SchemaType::String).required())
            .attribute(
                AttributeSchema::new("fingerprint", SchemaType::String)
                    .optional()
                    .computed()
                    .force_new(),
            );
        let state = ResourceState::new("key")
            .with_id("k1")
            .with_attribute("name", "deploy")
            .with_attribute("fingerprint", "ab:cd");
        let config = ResourceConfig::new()
            .with_attribute("name", "deploy")
            .with_attribute("fingerprint", "ef:01");

        let d = diff(&schema, &state, &config).unwrap();
        assert!(d.get("fingerprint").unwrap().requires_new);
    }

    #[test]
    fn replacement_diff_carries_unchanged_attributes() {
        // The create half of a destroy-and-recreate starts from a blank
        // state, so attributes that did not change must still be present.
        let schema = SchemaMap::new()
            .attribute(AttributeSchema::new("name", SchemaType::String).required())
            .attribute(
                AttributeSchema::new("stack", SchemaType::String)
                    .optional()
                    .force_new(),
            );
        let state = ResourceState::new("app")
            .with_id("a1")
            .with_attribute("name", "app")
            .with_attribute("stack", "cedar-14");
        let config = ResourceConfig::new()
            .with_attribute("name", "app")
            .with_attribute("stack", "heroku-18");

        let d = diff(&schema, &state, &config).unwrap();
        let name = d.get("name").unwrap();
        assert_eq!((name.old.as_str(), name.new.as_str()), ("app", "app"));
        assert!(d.get("stack").unwrap().requires_new);
    }

    #[test]
    fn unknown_value_is_new_computed_regardless_of_state() {
        let schema = SchemaMap::new()
            .attribute(AttributeSchema::new("arn", SchemaType::String).optional());
        let state = ResourceState::new("role").with_id("r1").with_attribute("arn", "arn:old");
        let config = ResourceConfig::new().with_attribute("arn", Value::Unknown);

        let d = diff(&schema, &state, &config).unwrap();
        let arn = d.get("arn").unwrap();
        assert!(arn.new_computed);
        assert_eq!(arn.old, "arn:old");
        assert!(!arn.requires_new);
    }

    #[test]
    fn set_diff_is_by_hash_not_position() {
        let schema = ingress_schema(Some(by_port));
        let element = |port: i64, cidr: &str| {
            Value::Map(std::collections::BTreeMap::from([
                ("port".to_string(), Value::Int(port)),
                ("cidr".to_string(), Value::String(cidr.to_string())),
            ]))
        };

        // Prior state: one rule, port 80, open cidr.
        let mut state = ResourceState::new("firewall").with_id("fw-1");
        flatten_attribute(
            &mut state.attributes,
            "ingress",
            schema.get("ingress").unwrap(),
            &Value::List(vec![element(80, "0.0.0.0/0")]),
        )
        .unwrap();

        // Config: keep port 80 with a new cidr, add port 443.
        let config = ResourceConfig::new().with_attribute(
            "ingress",
            Value::List(vec![element(80, "10.0.0.0/8"), element(443, "0.0.0.0/0")]),
        );

        let d = diff(&schema, &state, &config).unwrap();

        let cidr80 = d.get("ingress.80.cidr").unwrap();
        assert_eq!(cidr80.old, "0.0.0.0/0");
        assert_eq!(cidr80.new, "10.0.0.0/8");
        assert_eq!(d.get("ingress.443.port").unwrap().new, "443");
        assert_eq!(d.get("ingress.443.cidr").unwrap().new, "0.0.0.0/0");
        assert_eq!(d.get("ingress.#").map(|a| a.new.as_str()), Some("2"));
        assert!(
            !d.attributes.values().any(|a| a.new_removed),
            "the surviving port-80 bucket must not be recorded as a deletion: {d}"
        );
    }

    #[test]
    fn list_shrink_removes_trailing_indices() {
        let schema = SchemaMap::new().attribute(
            AttributeSchema::new("ports", SchemaType::List)
                .optional()
                .with_elem(Elem::Attr(Box::new(AttributeSchema::elem_of(SchemaType::Int)))),
        );
        let state = ResourceState::new("lb")
            .with_id("lb-1")
            .with_attribute("ports.#", "3")
            .with_attribute("ports.0", "80")
            .with_attribute("ports.1", "443")
            .with_attribute("ports.2", "8080");
        let config = ResourceConfig::from_json(serde_json::json!({"ports": [80, 443]}));

        let d = diff(&schema, &state, &config).unwrap();

        assert_eq!(d.get("ports.#").map(|a| a.new.as_str()), Some("2"));
        let removed = d.get("ports.2").unwrap();
        assert!(removed.new_removed);
        assert_eq!(removed.old, "8080");
        assert!(d.get("ports.0").is_none());
        assert!(d.get("ports.1").is_none());
    }

    #[test]
    fn map_diffs_per_key() {
        let schema = SchemaMap::new().attribute(
            AttributeSchema::new("tags", SchemaType::Map)
                .optional()
                .with_elem(Elem::Attr(Box::new(AttributeSchema::elem_of(
                    SchemaType::String,
                )))),
        );
        let state = ResourceState::new("vm")
            .with_id("vm-1")
            .with_attribute("tags.%", "2")
            .with_attribute("tags.env", "prod")
            .with_attribute("tags.team", "infra");
        let config = ResourceConfig::from_json(serde_json::json!({
            "tags": {"env": "staging", "team": "infra"},
        }));

        let d = diff(&schema, &state, &config).unwrap();

        assert_eq!(d.attributes.len(), 1);
        let env = d.get("tags.env").unwrap();
        assert_eq!((env.old.as_str(), env.new.as_str()), ("prod", "staging"));
    }

    #[test]
    fn zero_value_against_absent_state_is_not_a_change() {
        let schema = SchemaMap::new()
            .attribute(AttributeSchema::new("enabled", SchemaType::Bool).optional())
            .attribute(AttributeSchema::new("weight", SchemaType::Int).optional());
        let state = ResourceState::new("rule").with_id("r1");
        let config = ResourceConfig::new()
            .with_attribute("enabled", false)
            .with_attribute("weight", 0i64);

        let d = diff(&schema, &state, &config).unwrap();
        assert!(d.is_empty(), "got: {d}");
    }

    #[test]
    fn zero_value_on_required_attribute_still_diffs() {
        let schema = SchemaMap::new()
            .attribute(AttributeSchema::new("weight", SchemaType::Int).required());
        let state = ResourceState::new("rule").with_id("r1");
        let config = ResourceConfig::new().with_attribute("weight", 0i64);

        let d = diff(&schema, &state, &config).unwrap();
        assert_eq!(d.get("weight").map(|a| a.new.as_str()), Some("0"));
    }

    #[test]
    fn computed_attribute_with_state_is_preserved() {
        let schema = app_schema();
        let state = ResourceState::new("app")
            .with_id("app-1")
            .with_attribute("name", "app")
            .with_attribute("region", "us-east")
            .with_attribute("id", "app-1");
        // Optional+computed attribute removed from config: no diff entry.
        let config = ResourceConfig::new().with_attribute("name", "app");

        let d = diff(&schema, &state, &config).unwrap();
        assert!(d.get("id").is_none());
    }

    #[test]
    fn removing_an_optional_attribute_is_recorded() {
        let schema = SchemaMap::new()
            .attribute(AttributeSchema::new("name", SchemaType::String).required())
            .attribute(AttributeSchema::new("note", SchemaType::String).optional());
        let state = ResourceState::new("app")
            .with_id("a1")
            .with_attribute("name", "app")
            .with_attribute("note", "hello");
        let config = ResourceConfig::new().with_attribute("name", "app");

        let d = diff(&schema, &state, &config).unwrap();
        let note = d.get("note").unwrap();
        assert!(note.new_removed);
        assert_eq!(note.old, "hello");
    }

    #[test]
    fn state_func_normalizes_both_sides() {
        fn lowercase(s: &str) -> String {
            s.to_ascii_lowercase()
        }
        let schema = SchemaMap::new().attribute(
            AttributeSchema::new("zone", SchemaType::String)
                .optional()
                .with_state_func(lowercase),
        );
        let state = ResourceState::new("dns")
            .with_id("d1")
            .with_attribute("zone", "US-EAST");
        let config = ResourceConfig::new().with_attribute("zone", "us-East");

        let d = diff(&schema, &state, &config).unwrap();
        assert!(d.is_empty(), "normalized values must compare equal: {d}");
    }

    #[test]
    fn coercion_failure_surfaces_as_an_error() {
        let schema = SchemaMap::new()
            .attribute(AttributeSchema::new("weight", SchemaType::Int).required());
        let state = ResourceState::new("rule");
        let config = ResourceConfig::new().with_attribute("weight", "heavy");

        let err = diff(&schema, &state, &config).unwrap_err();
        assert_eq!(err.path, "weight");
    }

    #[test]
    fn destroy_diff_requires_new_and_is_not_empty() {
        let d = InstanceDiff::for_destroy();
        assert!(!d.is_empty());
        assert!(d.requires_new());
    }

    #[test]
    fn display_masks_sensitive_values() {
        let schema = SchemaMap::new().attribute(
            AttributeSchema::new("password", SchemaType::String)
                .optional()
                .sensitive(),
        );
        let state = ResourceState::new("db")
            .with_id("db-1")
            .with_attribute("password", "hunter2");
        let config = ResourceConfig::new().with_attribute("password", "correct-horse");

        let d = diff(&schema, &state, &config).unwrap();
        let rendered = d.to_string();
        assert!(!rendered.contains("hunter2"), "{rendered}");
        assert!(!rendered.contains("correct-horse"), "{rendered}");
        assert!(rendered.contains("(sensitive)"));
    }

    #[test]
    fn has_change_under_matches_nested_entries() {
        let schema = ingress_schema(Some(by_port));
        let state = ResourceState::new("firewall").with_id("fw-1");
        let config = ResourceConfig::from_json(serde_json::json!({
            "ingress": [{"port": 80, "cidr": "0.0.0.0/0"}],
        }));

        let d = diff(&schema, &state, &config).unwrap();
        assert!(d.has_change_under("ingress"));
        assert!(!d.has_change_under("ingres"));
    }

    #[test]
    fn diff_round_trips_through_serde() {
        let schema = app_schema();
        let state = ResourceState::new("app");
        let config = ResourceConfig::new().with_attribute("name", "app");

        let d = diff(&schema, &state, &config).unwrap();
        let encoded = serde_json::to_string(&d).unwrap();
        let decoded: InstanceDiff = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, d);
    }
}

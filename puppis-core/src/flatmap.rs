//! Flat form - the canonical string encoding of attribute values
//!
//! State stores every attribute as `dotted.path -> string`. Containers get
//! a synthetic count child (`x.#` for lists and sets, `x.%` for maps), list
//! elements are keyed by position, set elements by a stable hash, and object
//! fields by name. Reconstruction is driven entirely by the schema.

use std::collections::{BTreeMap, BTreeSet};

use crate::resource::Value;
use crate::schema::{AttributeSchema, CoercionError, Elem, SchemaMap, SchemaType};
use crate::utils::fnv1a_hash;

/// Render an already-coerced primitive into its flat string.
pub fn primitive_to_flat(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::String(s) => s.clone(),
        // Containers and unknowns never reach the primitive leaf writer.
        _ => String::new(),
    }
}

fn mismatch(path: &str, expected: &str, got: &Value) -> CoercionError {
    CoercionError {
        path: path.to_string(),
        expected: expected.to_string(),
        got: got.type_name().to_string(),
    }
}

/// Flatten one attribute's typed value into `out` under `path`, coercing
/// each leaf to its declared type and applying state normalizers.
pub fn flatten_attribute(
    out: &mut BTreeMap<String, String>,
    path: &str,
    attr: &AttributeSchema,
    value: &Value,
) -> Result<(), CoercionError> {
    if value.is_null() {
        return Ok(());
    }

    match attr.attr_type {
        SchemaType::Bool | SchemaType::Int | SchemaType::String => {
            let coerced = attr
                .attr_type
                .coerce_primitive(value)
                .ok_or_else(|| mismatch(path, attr.attr_type.type_name(), value))?;
            let flat = attr.normalize_flat(primitive_to_flat(&coerced));
            out.insert(path.to_string(), flat);
        }
        SchemaType::List => {
            let Value::List(items) = value else {
                return Err(mismatch(path, "List", value));
            };
            out.insert(format!("{path}.#"), items.len().to_string());
            for (i, item) in items.iter().enumerate() {
                flatten_element(out, &format!("{path}.{i}"), attr, item)?;
            }
        }
        SchemaType::Set => {
            let Value::List(items) = value else {
                return Err(mismatch(path, "Set", value));
            };
            // Duplicate elements collapse onto the same hash bucket.
            let mut seen = BTreeSet::new();
            for item in items {
                let hash = set_element_hash(attr, item)?;
                if !seen.insert(hash) {
                    continue;
                }
                flatten_element(out, &format!("{path}.{hash}"), attr, item)?;
            }
            out.insert(format!("{path}.#"), seen.len().to_string());
        }
        SchemaType::Map => {
            let Value::Map(entries) = value else {
                return Err(mismatch(path, "Map", value));
            };
            out.insert(format!("{path}.%"), entries.len().to_string());
            for (key, v) in entries {
                if v.is_null() {
                    continue;
                }
                let entry_path = format!("{path}.{key}");
                match &attr.elem {
                    Some(Elem::Attr(inner)) => flatten_attribute(out, &entry_path, inner, v)?,
                    // Maps of objects are rejected at declaration time;
                    // without an elem the values are treated as strings.
                    _ => {
                        let coerced = SchemaType::String
                            .coerce_primitive(v)
                            .ok_or_else(|| mismatch(&entry_path, "String", v))?;
                        out.insert(entry_path, primitive_to_flat(&coerced));
                    }
                }
            }
        }
    }
    Ok(())
}

fn flatten_element(
    out: &mut BTreeMap<String, String>,
    path: &str,
    container: &AttributeSchema,
    value: &Value,
) -> Result<(), CoercionError> {
    match &container.elem {
        Some(Elem::Attr(inner)) => flatten_attribute(out, path, inner, value),
        Some(Elem::Object(fields)) => flatten_object(out, path, fields, value),
        None => Ok(()),
    }
}

/// Flatten one object element field-by-field; absent fields fall back to
/// their defaults so both sides of a comparison carry them.
pub fn flatten_object(
    out: &mut BTreeMap<String, String>,
    path: &str,
    fields: &SchemaMap,
    value: &Value,
) -> Result<(), CoercionError> {
    let Value::Map(entries) = value else {
        return Err(mismatch(path, "Object", value));
    };

    for (name, field) in fields.iter() {
        let field_path = format!("{path}.{name}");
        match entries.get(name) {
            Some(v) if !v.is_null() => flatten_attribute(out, &field_path, field, v)?,
            _ => {
                if let Some(default) = &field.default {
                    flatten_attribute(out, &field_path, field, default)?;
                }
            }
        }
    }
    Ok(())
}

/// Stable key of one set element: the caller-supplied hash when the schema
/// carries one, otherwise FNV-1a over the element's canonical flat form.
pub fn set_element_hash(attr: &AttributeSchema, value: &Value) -> Result<u64, CoercionError> {
    if let Some(hash) = attr.set_hash {
        return Ok(hash(value));
    }

    let mut tmp = BTreeMap::new();
    flatten_element(&mut tmp, "e", attr, value)?;
    let canonical = tmp
        .iter()
        .map(|(k, v)| format!("{}={}", k.strip_prefix("e.").unwrap_or_default(), v))
        .collect::<Vec<_>>()
        .join(";");
    Ok(fnv1a_hash(&canonical))
}

/// Distinct first path components under `path.` (list indices, set hashes,
/// map keys), excluding count markers. Sorted, since the source is sorted.
pub fn child_components(flat: &BTreeMap<String, String>, path: &str) -> Vec<String> {
    let prefix = format!("{path}.");
    let mut components = BTreeSet::new();
    for key in flat.range(prefix.clone()..).map(|(k, _)| k) {
        let Some(rest) = key.strip_prefix(&prefix) else {
            break;
        };
        let component = rest.split('.').next().unwrap_or(rest);
        if component != "#" && component != "%" {
            components.insert(component.to_string());
        }
    }
    components.into_iter().collect()
}

/// Reassemble the typed value stored at `path`, whose schema is `attr`.
/// Returns `None` when the flat map holds nothing for that path.
pub fn read_attribute(
    flat: &BTreeMap<String, String>,
    path: &str,
    attr: &AttributeSchema,
) -> Option<Value> {
    match attr.attr_type {
        SchemaType::Bool => flat.get(path).map(|s| Value::Bool(s == "true")),
        SchemaType::Int => flat
            .get(path)
            .map(|s| s.parse::<i64>().map(Value::Int).unwrap_or(Value::Null)),
        SchemaType::String => flat.get(path).map(|s| Value::String(s.clone())),
        SchemaType::List => {
            let count: usize = flat.get(&format!("{path}.#"))?.parse().ok()?;
            let mut items = Vec::with_capacity(count);
            for i in 0..count {
                let item = read_element(flat, &format!("{path}.{i}"), attr);
                items.push(item.unwrap_or(Value::Null));
            }
            Some(Value::List(items))
        }
        SchemaType::Set => {
            flat.get(&format!("{path}.#"))?;
            let items = child_components(flat, path)
                .iter()
                .filter_map(|hash| read_element(flat, &format!("{path}.{hash}"), attr))
                .collect();
            Some(Value::List(items))
        }
        SchemaType::Map => {
            flat.get(&format!("{path}.%"))?;
            let mut entries = BTreeMap::new();
            for key in child_components(flat, path) {
                let entry_path = format!("{path}.{key}");
                let value = match &attr.elem {
                    Some(Elem::Attr(inner)) => read_attribute(flat, &entry_path, inner),
                    _ => flat.get(&entry_path).map(|s| Value::String(s.clone())),
                };
                if let Some(v) = value {
                    entries.insert(key, v);
                }
            }
            Some(Value::Map(entries))
        }
    }
}

fn read_element(
    flat: &BTreeMap<String, String>,
    path: &str,
    container: &AttributeSchema,
) -> Option<Value> {
    match &container.elem {
        Some(Elem::Attr(inner)) => read_attribute(flat, path, inner),
        Some(Elem::Object(fields)) => read_object(flat, path, fields),
        None => None,
    }
}

/// Reassemble one object element from its flattened fields.
pub fn read_object(
    flat: &BTreeMap<String, String>,
    path: &str,
    fields: &SchemaMap,
) -> Option<Value> {
    let mut entries = BTreeMap::new();
    for (name, field) in fields.iter() {
        if let Some(v) = read_attribute(flat, &format!("{path}.{name}"), field) {
            entries.insert(name.to_string(), v);
        }
    }
    if entries.is_empty() {
        None
    } else {
        Some(Value::Map(entries))
    }
}

/// What a dotted path addresses within a schema.
#[derive(Debug)]
pub enum PathTarget<'a> {
    /// A full attribute or container-element subtree.
    Attribute(&'a AttributeSchema),
    /// An object element of a list or set.
    Object(&'a SchemaMap),
    /// A `.#` / `.%` count marker.
    Count(SchemaType),
}

/// Resolve a dotted path (`"ingress.0.port"`) against a schema map.
pub fn resolve_path<'a>(schema: &'a SchemaMap, path: &str) -> Option<PathTarget<'a>> {
    let mut parts = path.split('.');
    let mut target = PathTarget::Attribute(schema.get(parts.next()?)?);

    for part in parts {
        target = match target {
            PathTarget::Attribute(attr) => match attr.attr_type {
                SchemaType::List | SchemaType::Set => {
                    if part == "#" {
                        PathTarget::Count(attr.attr_type)
                    } else {
                        match attr.elem.as_ref()? {
                            Elem::Attr(inner) => PathTarget::Attribute(inner),
                            Elem::Object(fields) => PathTarget::Object(fields),
                        }
                    }
                }
                SchemaType::Map => {
                    if part == "%" {
                        PathTarget::Count(SchemaType::Map)
                    } else {
                        match attr.elem.as_ref()? {
                            Elem::Attr(inner) => PathTarget::Attribute(inner),
                            Elem::Object(_) => return None,
                        }
                    }
                }
                _ => return None,
            },
            PathTarget::Object(fields) => PathTarget::Attribute(fields.get(part)?),
            PathTarget::Count(_) => return None,
        };
    }
    Some(target)
}

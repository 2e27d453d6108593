//! Schema - declarative description of resource attributes
//!
//! Providers declare a schema per resource type and get configuration
//! validation, structural diffing, and typed CRUD accessors from the core.

use std::fmt;

use indexmap::IndexMap;

use crate::resource::{ResourceConfig, Value};

/// Attribute type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaType {
    Bool,
    Int,
    String,
    /// Ordered container; diffs are positional.
    List,
    /// Flat mapping from string key to primitive; diffs are per-key.
    Map,
    /// Unordered container; elements are keyed by a stable hash.
    Set,
}

impl SchemaType {
    pub fn is_primitive(self) -> bool {
        matches!(self, SchemaType::Bool | SchemaType::Int | SchemaType::String)
    }

    pub fn is_container(self) -> bool {
        !self.is_primitive()
    }

    pub fn type_name(self) -> &'static str {
        match self {
            SchemaType::Bool => "Bool",
            SchemaType::Int => "Int",
            SchemaType::String => "String",
            SchemaType::List => "List",
            SchemaType::Map => "Map",
            SchemaType::Set => "Set",
        }
    }

    /// The synthetic child key holding this container's element count.
    pub fn count_suffix(self) -> Option<&'static str> {
        match self {
            SchemaType::List | SchemaType::Set => Some("#"),
            SchemaType::Map => Some("%"),
            _ => None,
        }
    }

    /// Coerce a config value to this primitive type. Strings parse into
    /// ints and bools; ints and bools render into strings. Returns `None`
    /// for containers and for values with no sensible conversion.
    pub fn coerce_primitive(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (SchemaType::Bool, Value::Bool(b)) => Some(Value::Bool(*b)),
            (SchemaType::Bool, Value::String(s)) => match s.as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (SchemaType::Int, Value::Int(n)) => Some(Value::Int(*n)),
            (SchemaType::Int, Value::String(s)) => s.parse::<i64>().ok().map(Value::Int),
            (SchemaType::String, Value::String(s)) => Some(Value::String(s.clone())),
            (SchemaType::String, Value::Int(n)) => Some(Value::String(n.to_string())),
            (SchemaType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
            _ => None,
        }
    }

    /// The flat-form zero of this type (absent attributes read as this).
    pub fn zero_flat(self) -> &'static str {
        match self {
            SchemaType::Bool => "false",
            SchemaType::Int => "0",
            SchemaType::String => "",
            SchemaType::List | SchemaType::Set | SchemaType::Map => "0",
        }
    }

    /// Whether a flat value is indistinguishable from "never set". For
    /// containers this is asked of the count marker.
    pub fn is_zero_flat(self, s: &str) -> bool {
        s.is_empty() || s == self.zero_flat()
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Element description for container types: either a single schema shared
/// by every element, or a full attribute map for container-of-object.
#[derive(Debug, Clone)]
pub enum Elem {
    Attr(Box<AttributeSchema>),
    Object(SchemaMap),
}

/// Normalizer applied to a flat value before comparison and storage.
pub type StateFunc = fn(&str) -> String;

/// Per-value predicate: `(value, path)` to `(warnings, error messages)`.
pub type ValidateFunc = fn(&Value, &str) -> (Vec<String>, Vec<String>);

/// Reduces one set element to its stable key within flat paths.
pub type SetHashFunc = fn(&Value) -> u64;

/// Schema for one named attribute.
#[derive(Debug, Clone)]
pub struct AttributeSchema {
    pub name: String,
    pub attr_type: SchemaType,
    /// The user may set this attribute.
    pub optional: bool,
    /// The user must set this attribute.
    pub required: bool,
    /// The provider supplies the value (possibly on top of user input when
    /// combined with `optional`).
    pub computed: bool,
    /// Changing this attribute destroys and recreates the instance.
    pub force_new: bool,
    /// Masked in rendered diffs.
    pub sensitive: bool,
    /// Used when the attribute is absent from configuration.
    pub default: Option<Value>,
    /// Element schema; required for containers.
    pub elem: Option<Elem>,
    /// Lower bound on container length (0 = unbounded).
    pub min_items: usize,
    /// Upper bound on container length (0 = unbounded).
    pub max_items: usize,
    pub state_func: Option<StateFunc>,
    pub validate_func: Option<ValidateFunc>,
    pub set_hash: Option<SetHashFunc>,
    pub description: Option<String>,
}

impl AttributeSchema {
    pub fn new(name: impl Into<String>, attr_type: SchemaType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            optional: false,
            required: false,
            computed: false,
            force_new: false,
            sensitive: false,
            default: None,
            elem: None,
            min_items: 0,
            max_items: 0,
            state_func: None,
            validate_func: None,
            set_hash: None,
            description: None,
        }
    }

    /// An element schema for primitive containers; carries no role flags.
    pub fn elem_of(attr_type: SchemaType) -> Self {
        Self::new("", attr_type)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_elem(mut self, elem: Elem) -> Self {
        self.elem = Some(elem);
        self
    }

    pub fn with_min_items(mut self, n: usize) -> Self {
        self.min_items = n;
        self
    }

    pub fn with_max_items(mut self, n: usize) -> Self {
        self.max_items = n;
        self
    }

    pub fn with_state_func(mut self, f: StateFunc) -> Self {
        self.state_func = Some(f);
        self
    }

    pub fn with_validate_func(mut self, f: ValidateFunc) -> Self {
        self.validate_func = Some(f);
        self
    }

    pub fn with_set_hash(mut self, f: SetHashFunc) -> Self {
        self.set_hash = Some(f);
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Apply the state normalizer, if any, to a flat value.
    pub fn normalize_flat(&self, s: String) -> String {
        match self.state_func {
            Some(f) => f(&s),
            None => s,
        }
    }

    /// Declaration-consistency check, run once at provider registration.
    fn internal_validate(&self, path: &str, require_role: bool) -> Result<(), SchemaDeclarationError> {
        let at = |path: &str| path.to_string();

        if require_role && !self.optional && !self.required && !self.computed {
            return Err(SchemaDeclarationError::NoRole { path: at(path) });
        }
        if self.optional && self.required {
            return Err(SchemaDeclarationError::OptionalConflictsRequired { path: at(path) });
        }
        if self.required && self.computed {
            return Err(SchemaDeclarationError::RequiredConflictsComputed { path: at(path) });
        }
        if self.default.is_some() {
            if self.required {
                return Err(SchemaDeclarationError::DefaultOnRequired { path: at(path) });
            }
            if self.computed {
                return Err(SchemaDeclarationError::DefaultOnComputed { path: at(path) });
            }
            if let Some(default) = &self.default
                && self.attr_type.is_primitive()
                && self.attr_type.coerce_primitive(default).is_none()
            {
                return Err(SchemaDeclarationError::InvalidDefault {
                    path: at(path),
                    expected: self.attr_type.type_name().to_string(),
                });
            }
        }
        if self.set_hash.is_some() && self.attr_type != SchemaType::Set {
            return Err(SchemaDeclarationError::SetHashOnNonSet { path: at(path) });
        }
        if (self.min_items > 0 || self.max_items > 0)
            && !matches!(self.attr_type, SchemaType::List | SchemaType::Set)
        {
            return Err(SchemaDeclarationError::ItemBoundsOnNonContainer { path: at(path) });
        }
        if self.max_items > 0 && self.max_items < self.min_items {
            return Err(SchemaDeclarationError::InvalidItemBounds { path: at(path) });
        }

        match self.attr_type {
            SchemaType::List | SchemaType::Set => match &self.elem {
                None => Err(SchemaDeclarationError::MissingElem {
                    path: at(path),
                    kind: self.attr_type.type_name().to_string(),
                }),
                Some(Elem::Attr(inner)) => {
                    inner.internal_validate(&format!("{path}.*"), false)
                }
                Some(Elem::Object(fields)) => fields.internal_validate_at(path),
            },
            SchemaType::Map => match &self.elem {
                None => Err(SchemaDeclarationError::MissingElem {
                    path: at(path),
                    kind: "Map".to_string(),
                }),
                Some(Elem::Object(_)) => {
                    Err(SchemaDeclarationError::MapOfObjects { path: at(path) })
                }
                Some(Elem::Attr(inner)) if !inner.attr_type.is_primitive() => {
                    Err(SchemaDeclarationError::InvalidMapElem { path: at(path) })
                }
                Some(Elem::Attr(_)) => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Type-check one config value for this attribute, accumulating into
    /// `warnings` and `errors`. `path` is the flat address for messages.
    fn validate_value(
        &self,
        path: &str,
        value: &Value,
        warnings: &mut Vec<String>,
        errors: &mut Vec<ValidationError>,
    ) {
        let before = errors.len();

        match self.attr_type {
            SchemaType::Bool | SchemaType::Int | SchemaType::String => {
                if self.attr_type.coerce_primitive(value).is_none() {
                    errors.push(ValidationError::Coercion(CoercionError {
                        path: path.to_string(),
                        expected: self.attr_type.type_name().to_string(),
                        got: value.type_name().to_string(),
                    }));
                }
            }
            SchemaType::List | SchemaType::Set => {
                let Value::List(items) = value else {
                    errors.push(ValidationError::Coercion(CoercionError {
                        path: path.to_string(),
                        expected: self.attr_type.type_name().to_string(),
                        got: value.type_name().to_string(),
                    }));
                    return;
                };
                if self.min_items > 0 && items.len() < self.min_items {
                    errors.push(ValidationError::Invalid {
                        key: path.to_string(),
                        message: format!(
                            "attribute requires at least {} item(s), config has {}",
                            self.min_items,
                            items.len()
                        ),
                    });
                }
                if self.max_items > 0 && items.len() > self.max_items {
                    errors.push(ValidationError::Invalid {
                        key: path.to_string(),
                        message: format!(
                            "attribute supports at most {} item(s), config has {}",
                            self.max_items,
                            items.len()
                        ),
                    });
                }
                for (i, item) in items.iter().enumerate() {
                    if item.contains_unknown() {
                        continue;
                    }
                    let item_path = format!("{path}.{i}");
                    match &self.elem {
                        Some(Elem::Attr(inner)) => {
                            inner.validate_value(&item_path, item, warnings, errors)
                        }
                        Some(Elem::Object(fields)) => {
                            validate_object(fields, &item_path, item, warnings, errors)
                        }
                        None => {}
                    }
                }
            }
            SchemaType::Map => {
                let Value::Map(entries) = value else {
                    errors.push(ValidationError::Coercion(CoercionError {
                        path: path.to_string(),
                        expected: "Map".to_string(),
                        got: value.type_name().to_string(),
                    }));
                    return;
                };
                if let Some(Elem::Attr(inner)) = &self.elem {
                    for (k, v) in entries {
                        if v.contains_unknown() {
                            continue;
                        }
                        inner.validate_value(&format!("{path}.{k}"), v, warnings, errors);
                    }
                }
            }
        }

        // Custom validation only runs on structurally sound values.
        if errors.len() == before
            && let Some(vf) = self.validate_func
        {
            let (w, e) = vf(value, path);
            warnings.extend(w);
            errors.extend(e.into_iter().map(|message| ValidationError::Invalid {
                key: path.to_string(),
                message,
            }));
        }
    }
}

fn validate_object(
    fields: &SchemaMap,
    path: &str,
    value: &Value,
    warnings: &mut Vec<String>,
    errors: &mut Vec<ValidationError>,
) {
    let Value::Map(entries) = value else {
        errors.push(ValidationError::Coercion(CoercionError {
            path: path.to_string(),
            expected: "Object".to_string(),
            got: value.type_name().to_string(),
        }));
        return;
    };

    for (name, field) in fields.iter() {
        let field_path = format!("{path}.{name}");
        match entries.get(name) {
            None | Some(Value::Null) => {
                if field.required {
                    errors.push(ValidationError::MissingRequired { key: field_path });
                }
            }
            Some(v) if v.contains_unknown() => {}
            Some(v) => field.validate_value(&field_path, v, warnings, errors),
        }
    }
    for key in entries.keys() {
        if !fields.contains(key) {
            errors.push(ValidationError::UnknownKey {
                key: format!("{path}.{key}"),
            });
        }
    }
}

/// Named collection of attribute schemas. Declaration order is preserved so
/// validation output is deterministic.
#[derive(Debug, Clone, Default)]
pub struct SchemaMap {
    attributes: IndexMap<String, AttributeSchema>,
}

impl SchemaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(mut self, schema: AttributeSchema) -> Self {
        self.attributes.insert(schema.name.clone(), schema);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeSchema)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Declaration-consistency check for every attribute, recursively.
    /// Fatal to the provider; run once at registration.
    pub fn internal_validate(&self) -> Result<(), SchemaDeclarationError> {
        self.internal_validate_at("")
    }

    fn internal_validate_at(&self, prefix: &str) -> Result<(), SchemaDeclarationError> {
        for (name, attr) in self.iter() {
            let path = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}.{name}")
            };
            attr.internal_validate(&path, true)?;
        }
        Ok(())
    }

    /// Validate a raw configuration against this schema.
    ///
    /// Walks every declared attribute, then flags undeclared keys. Never
    /// stops at the first problem; the caller gets the full list. Values
    /// with pending interpolation skip all checks for their path.
    pub fn validate(&self, config: &ResourceConfig) -> (Vec<String>, Vec<ValidationError>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        for (name, attr) in self.iter() {
            match config.get(name) {
                None | Some(Value::Null) => {
                    if attr.required && attr.default.is_none() {
                        errors.push(ValidationError::MissingRequired {
                            key: name.to_string(),
                        });
                    }
                }
                Some(v) if v.contains_unknown() => {}
                Some(v) => attr.validate_value(name, v, &mut warnings, &mut errors),
            }
        }

        for key in config.keys() {
            if !self.contains(key) {
                errors.push(ValidationError::UnknownKey {
                    key: key.to_string(),
                });
            }
        }

        (warnings, errors)
    }

    /// Structural diff between prior state and desired configuration.
    pub fn diff(
        &self,
        state: &crate::resource::ResourceState,
        config: &ResourceConfig,
    ) -> Result<crate::differ::InstanceDiff, CoercionError> {
        crate::differ::diff(self, state, config)
    }
}

/// A value could not be converted to its declared type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: expected {expected}, got {got}")]
pub struct CoercionError {
    pub path: String,
    pub expected: String,
    pub got: String,
}

/// The schema itself is inconsistent. Raised by `internal_validate` at
/// provider registration; fatal to the whole provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaDeclarationError {
    #[error("{path}: one of optional, required, or computed must be set")]
    NoRole { path: String },

    #[error("{path}: optional and required are mutually exclusive")]
    OptionalConflictsRequired { path: String },

    #[error("{path}: required attributes cannot be computed")]
    RequiredConflictsComputed { path: String },

    #[error("{path}: default is meaningless on a required attribute")]
    DefaultOnRequired { path: String },

    #[error("{path}: default cannot be combined with computed")]
    DefaultOnComputed { path: String },

    #[error("{path}: default value is not a valid {expected}")]
    InvalidDefault { path: String, expected: String },

    #[error("{path}: {kind} requires an element schema")]
    MissingElem { path: String, kind: String },

    #[error("{path}: maps of objects are not supported, use a list of objects")]
    MapOfObjects { path: String },

    #[error("{path}: map elements must be a primitive type")]
    InvalidMapElem { path: String },

    #[error("{path}: set_hash is only valid on sets")]
    SetHashOnNonSet { path: String },

    #[error("{path}: item bounds are only valid on lists and sets")]
    ItemBoundsOnNonContainer { path: String },

    #[error("{path}: max_items must not be less than min_items")]
    InvalidItemBounds { path: String },

    #[error("resource {resource}: missing {operation} handler")]
    MissingHandler {
        resource: String,
        operation: &'static str,
    },

    #[error("resource {resource}: update handler required when updatable attributes exist")]
    UpdateHandlerRequired { resource: String },
}

/// The configuration violates the schema. Accumulated, never short-circuited.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{key} is required")]
    MissingRequired { key: String },

    #[error("invalid or unknown key: {key}")]
    UnknownKey { key: String },

    #[error(transparent)]
    Coercion(#[from] CoercionError),

    #[error("{key}: {message}")]
    Invalid { key: String, message: String },
}

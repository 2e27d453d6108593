//! Resource - values, persisted state, desired configuration, and the
//! CRUD bundle that applies diffs to one resource instance

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::ResourceData;
use crate::differ::InstanceDiff;
use crate::schema::{SchemaDeclarationError, SchemaMap};

/// Attribute value of a resource.
///
/// This is the shape the configuration loader hands the core: JSON-like
/// nested data plus `Unknown` for values whose interpolation has not been
/// resolved yet. Set-typed attributes arrive as `List`; whether a list is
/// treated as a set is a property of the schema, not of the value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Interpolation pending; the value will only be known after apply.
    Unknown,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::String(_) => "String",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::Unknown => "Unknown",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Value::Unknown)
    }

    /// Returns true if this value, or any value nested inside it, is unknown.
    pub fn contains_unknown(&self) -> bool {
        match self {
            Value::Unknown => true,
            Value::List(items) => items.iter().any(Value::contains_unknown),
            Value::Map(entries) => entries.values().any(Value::contains_unknown),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<serde_json::Value> for Value {
    fn from(raw: serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                // Non-integral numbers are carried in their string form; the
                // schema decides what they coerce to.
                None => Value::String(n.to_string()),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Persisted representation of one resource instance.
///
/// Attributes are stored in the canonical flat form: dotted path to string,
/// with `.#` / `.%` count markers for containers. An empty `id` means the
/// instance has not been created yet (or has been destroyed).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub attributes: BTreeMap<String, String>,
}

impl ResourceState {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            type_name: type_name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Whether this state refers to a live remote object.
    pub fn exists(&self) -> bool {
        !self.id.is_empty()
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Desired configuration for one resource instance, as resolved by the
/// configuration loader: a nested map of values, with `Value::Unknown`
/// marking paths whose interpolation is still pending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceConfig {
    attributes: BTreeMap<String, Value>,
}

impl ResourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Build a config from a JSON object, the loader hand-off format.
    /// Non-object input yields an empty config.
    pub fn from_json(raw: serde_json::Value) -> Self {
        match Value::from(raw) {
            Value::Map(attributes) => Self { attributes },
            _ => Self::default(),
        }
    }

    /// Look up a value by dotted path, traversing maps by key and lists by
    /// numeric index (`"ingress.0.port"`).
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut parts = key.split('.');
        let mut current = self.attributes.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Map(entries) => entries.get(part)?,
                Value::List(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    /// Whether the value at `key` is (or contains) a pending interpolation.
    pub fn is_unknown(&self, key: &str) -> bool {
        self.get(key).is_some_and(Value::contains_unknown)
    }

    /// Top-level attribute names, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Error returned by a provider CRUD callback.
///
/// Carries the partially-applied state when a mutation failed midway, so the
/// engine can persist it instead of orphaning the remote object.
#[derive(Debug)]
pub struct CallbackError {
    pub message: String,
    /// Which CRUD operation failed ("create", "read", "update", "delete").
    pub operation: Option<&'static str>,
    /// State to persist despite the failure (id may already be set).
    pub partial: Option<ResourceState>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for CallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(op) = self.operation {
            write!(f, "[{}] {}", op, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for CallbackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            operation: None,
            partial: None,
            cause: None,
        }
    }

    /// Tag the error with the CRUD operation it came out of. A tag set by
    /// the callback itself is preserved.
    pub fn for_operation(mut self, operation: &'static str) -> Self {
        if self.operation.is_none() {
            self.operation = Some(operation);
        }
        self
    }

    pub fn with_partial(mut self, state: ResourceState) -> Self {
        self.partial = Some(state);
        self
    }

    fn with_partial_opt(mut self, state: Option<ResourceState>) -> Self {
        self.partial = state;
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

pub type CallbackResult<T> = Result<T, CallbackError>;

/// CRUD callback. Reads inputs and writes outputs through the
/// [`ResourceData`] handle; `M` is the provider's configured meta.
pub type CrudFunc<M> = fn(&mut ResourceData, &M) -> CallbackResult<()>;

/// A resource type: an attribute schema plus the CRUD callbacks that
/// reconcile one instance against the remote system.
#[derive(Debug)]
pub struct Resource<M> {
    pub schema: SchemaMap,
    create_func: Option<CrudFunc<M>>,
    read_func: Option<CrudFunc<M>>,
    update_func: Option<CrudFunc<M>>,
    delete_func: Option<CrudFunc<M>>,
}

impl<M> Resource<M> {
    pub fn new(schema: SchemaMap) -> Self {
        Self {
            schema,
            create_func: None,
            read_func: None,
            update_func: None,
            delete_func: None,
        }
    }

    pub fn with_create(mut self, f: CrudFunc<M>) -> Self {
        self.create_func = Some(f);
        self
    }

    pub fn with_read(mut self, f: CrudFunc<M>) -> Self {
        self.read_func = Some(f);
        self
    }

    pub fn with_update(mut self, f: CrudFunc<M>) -> Self {
        self.update_func = Some(f);
        self
    }

    pub fn with_delete(mut self, f: CrudFunc<M>) -> Self {
        self.delete_func = Some(f);
        self
    }

    /// Consistency check run once at provider registration.
    ///
    /// Create, read, and delete are always required. Update is required only
    /// when some attribute can actually change in place: an attribute the
    /// user sets (not purely computed) that does not force replacement.
    pub fn internal_validate(&self, type_name: &str) -> Result<(), SchemaDeclarationError> {
        self.schema.internal_validate()?;

        for (operation, func) in [
            ("create", self.create_func),
            ("read", self.read_func),
            ("delete", self.delete_func),
        ] {
            if func.is_none() {
                return Err(SchemaDeclarationError::MissingHandler {
                    resource: type_name.to_string(),
                    operation,
                });
            }
        }

        let updatable = self
            .schema
            .iter()
            .any(|(_, attr)| (attr.required || attr.optional) && !attr.force_new);
        if updatable && self.update_func.is_none() {
            return Err(SchemaDeclarationError::UpdateHandlerRequired {
                resource: type_name.to_string(),
            });
        }

        Ok(())
    }

    /// Apply `diff` to `state`, dispatching to the CRUD callbacks.
    ///
    /// Returns the new state (`None` when the instance is gone). On callback
    /// failure the error carries the partial state to persist: buffered
    /// writes are discarded, but an id set via `set_id` survives so a
    /// half-created remote object is not orphaned.
    pub fn apply(
        &self,
        state: &ResourceState,
        diff: &InstanceDiff,
        meta: &M,
    ) -> CallbackResult<Option<ResourceState>> {
        if diff.destroy {
            if !state.exists() {
                return Ok(None);
            }
            self.delete_instance(state, meta)?;
            return Ok(None);
        }

        if diff.is_empty() {
            // No-op: hand back the state untouched, no callback runs.
            return Ok(Some(state.clone()));
        }

        if state.exists() && diff.requires_new() {
            // Replace: destroy the old instance, then create against the
            // same diff from a blank state.
            self.delete_instance(state, meta)?;
            let blank = ResourceState::new(&state.type_name);
            return self.create_instance(&blank, diff, meta);
        }

        if !state.exists() {
            return self.create_instance(state, diff, meta);
        }

        self.update_instance(state, diff, meta)
    }

    /// Re-read the instance from the remote system. Returns `None` when the
    /// callback reports it gone (empty id).
    pub fn refresh(&self, state: &ResourceState, meta: &M) -> CallbackResult<Option<ResourceState>> {
        let Some(read) = self.read_func else {
            return Err(CallbackError::new("no read handler defined").for_operation("read"));
        };

        let mut data = ResourceData::new(&self.schema, state, None);
        if let Err(e) = read(&mut data, meta) {
            return Err(e.for_operation("read").with_partial(state.clone()));
        }
        if data.id().is_empty() {
            return Ok(None);
        }
        Ok(Some(data.into_state(&state.type_name)))
    }

    fn create_instance(
        &self,
        state: &ResourceState,
        diff: &InstanceDiff,
        meta: &M,
    ) -> CallbackResult<Option<ResourceState>> {
        let Some(create) = self.create_func else {
            return Err(CallbackError::new("no create handler defined").for_operation("create"));
        };

        let mut data = ResourceData::new(&self.schema, state, Some(diff));
        if let Err(e) = create(&mut data, meta) {
            let partial = partial_state(state, &data);
            return Err(e.for_operation("create").with_partial_opt(partial));
        }
        if data.id().is_empty() {
            return Ok(None);
        }
        let created = data.into_state(&state.type_name);
        self.read_back(created, meta)
    }

    fn update_instance(
        &self,
        state: &ResourceState,
        diff: &InstanceDiff,
        meta: &M,
    ) -> CallbackResult<Option<ResourceState>> {
        let Some(update) = self.update_func else {
            return Err(CallbackError::new("no update handler defined").for_operation("update"));
        };

        let mut data = ResourceData::new(&self.schema, state, Some(diff));
        if let Err(e) = update(&mut data, meta) {
            let partial = partial_state(state, &data);
            return Err(e.for_operation("update").with_partial_opt(partial));
        }
        if data.id().is_empty() {
            return Ok(None);
        }
        let updated = data.into_state(&state.type_name);
        self.read_back(updated, meta)
    }

    /// Refresh computed attributes after a successful create or update.
    fn read_back(&self, state: ResourceState, meta: &M) -> CallbackResult<Option<ResourceState>> {
        let Some(read) = self.read_func else {
            return Ok(Some(state));
        };

        let mut data = ResourceData::new(&self.schema, &state, None);
        if let Err(e) = read(&mut data, meta) {
            return Err(e.for_operation("read").with_partial(state));
        }
        if data.id().is_empty() {
            return Ok(None);
        }
        Ok(Some(data.into_state(&state.type_name)))
    }

    fn delete_instance(&self, state: &ResourceState, meta: &M) -> CallbackResult<()> {
        let Some(delete) = self.delete_func else {
            return Err(CallbackError::new("no delete handler defined").for_operation("delete"));
        };

        let mut data = ResourceData::new(&self.schema, state, None);
        delete(&mut data, meta).map_err(|e| e.for_operation("delete").with_partial(state.clone()))
    }
}

/// The state worth persisting after a failed mutation: the id the callback
/// managed to record, over the attributes the instance had before.
fn partial_state(state: &ResourceState, data: &ResourceData) -> Option<ResourceState> {
    let id = data.id();
    if id.is_empty() {
        if state.exists() {
            Some(state.clone())
        } else {
            None
        }
    } else {
        let mut partial = state.clone();
        partial.id = id.to_string();
        Some(partial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::differ::AttributeDiff;
    use crate::schema::{AttributeSchema, SchemaType};
    use std::sync::Mutex;

    struct TestBackend {
        calls: Mutex<Vec<&'static str>>,
        fail_create: bool,
    }

    impl TestBackend {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_create: false,
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn test_schema() -> SchemaMap {
        SchemaMap::new()
            .attribute(AttributeSchema::new("name", SchemaType::String).required())
            .attribute(AttributeSchema::new("id", SchemaType::String).computed())
    }

    fn create_ok(d: &mut ResourceData, m: &TestBackend) -> CallbackResult<()> {
        m.calls.lock().unwrap().push("create");
        d.set_id("r-1");
        if m.fail_create {
            return Err(CallbackError::new("backend rejected the request"));
        }
        d.set("id", "r-1").unwrap();
        Ok(())
    }

    fn read_ok(_d: &mut ResourceData, m: &TestBackend) -> CallbackResult<()> {
        m.calls.lock().unwrap().push("read");
        Ok(())
    }

    fn update_ok(_d: &mut ResourceData, m: &TestBackend) -> CallbackResult<()> {
        m.calls.lock().unwrap().push("update");
        Ok(())
    }

    fn delete_ok(d: &mut ResourceData, m: &TestBackend) -> CallbackResult<()> {
        m.calls.lock().unwrap().push("delete");
        d.set_id("");
        Ok(())
    }

    fn test_resource() -> Resource<TestBackend> {
        Resource::new(test_schema())
            .with_create(create_ok)
            .with_read(read_ok)
            .with_update(update_ok)
            .with_delete(delete_ok)
    }

    fn name_change(old: &str, new: &str, requires_new: bool) -> InstanceDiff {
        let mut diff = InstanceDiff::new();
        diff.attributes.insert(
            "name".to_string(),
            AttributeDiff {
                old: old.to_string(),
                new: new.to_string(),
                requires_new,
                ..Default::default()
            },
        );
        diff
    }

    #[test]
    fn empty_diff_is_a_noop() {
        let resource = test_resource();
        let backend = TestBackend::new();
        let state = ResourceState::new("test_thing")
            .with_id("r-1")
            .with_attribute("name", "a");

        let result = resource
            .apply(&state, &InstanceDiff::new(), &backend)
            .unwrap();

        assert_eq!(result, Some(state));
        assert!(backend.calls().is_empty(), "no callback may run");
    }

    #[test]
    fn create_when_state_has_no_id() {
        let resource = test_resource();
        let backend = TestBackend::new();
        let state = ResourceState::new("test_thing");

        let result = resource
            .apply(&state, &name_change("", "a", false), &backend)
            .unwrap()
            .unwrap();

        assert_eq!(result.id, "r-1");
        assert_eq!(result.attribute("name"), Some("a"));
        assert_eq!(backend.calls(), vec!["create", "read"]);
    }

    #[test]
    fn update_when_state_exists() {
        let resource = test_resource();
        let backend = TestBackend::new();
        let state = ResourceState::new("test_thing")
            .with_id("r-1")
            .with_attribute("name", "a");

        let result = resource
            .apply(&state, &name_change("a", "b", false), &backend)
            .unwrap()
            .unwrap();

        assert_eq!(result.attribute("name"), Some("b"));
        assert_eq!(backend.calls(), vec!["update", "read"]);
    }

    #[test]
    fn requires_new_runs_delete_then_create() {
        let resource = test_resource();
        let backend = TestBackend::new();
        let state = ResourceState::new("test_thing")
            .with_id("r-0")
            .with_attribute("name", "a");

        let result = resource
            .apply(&state, &name_change("a", "b", true), &backend)
            .unwrap()
            .unwrap();

        assert_eq!(backend.calls(), vec!["delete", "create", "read"]);
        assert_eq!(result.id, "r-1", "new instance carries the fresh id");
        assert_eq!(result.attribute("name"), Some("b"));
    }

    #[test]
    fn destroy_diff_calls_delete_and_returns_none() {
        let resource = test_resource();
        let backend = TestBackend::new();
        let state = ResourceState::new("test_thing").with_id("r-1");

        let result = resource
            .apply(&state, &InstanceDiff::for_destroy(), &backend)
            .unwrap();

        assert_eq!(result, None);
        assert_eq!(backend.calls(), vec!["delete"]);
    }

    #[test]
    fn destroy_of_absent_instance_skips_delete() {
        let resource = test_resource();
        let backend = TestBackend::new();
        let state = ResourceState::new("test_thing");

        let result = resource
            .apply(&state, &InstanceDiff::for_destroy(), &backend)
            .unwrap();

        assert_eq!(result, None);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn failed_create_keeps_the_id_the_callback_set() {
        let resource = test_resource();
        let mut backend = TestBackend::new();
        backend.fail_create = true;
        let state = ResourceState::new("test_thing");

        let err = resource
            .apply(&state, &name_change("", "a", false), &backend)
            .unwrap_err();

        let partial = err.partial.expect("partial state must be carried");
        assert_eq!(partial.id, "r-1");
        assert_eq!(err.operation, Some("create"));
        assert_eq!(backend.calls(), vec!["create"], "read must not run");
    }

    #[test]
    fn refresh_with_empty_id_reports_gone() {
        fn read_gone(d: &mut ResourceData, _m: &TestBackend) -> CallbackResult<()> {
            d.set_id("");
            Ok(())
        }

        let resource = Resource::new(test_schema())
            .with_create(create_ok)
            .with_read(read_gone)
            .with_update(update_ok)
            .with_delete(delete_ok);
        let backend = TestBackend::new();
        let state = ResourceState::new("test_thing").with_id("r-1");

        assert_eq!(resource.refresh(&state, &backend).unwrap(), None);
    }

    #[test]
    fn internal_validate_requires_crud_handlers() {
        let resource: Resource<TestBackend> = Resource::new(test_schema());
        let err = resource.internal_validate("test_thing").unwrap_err();
        assert!(matches!(
            err,
            SchemaDeclarationError::MissingHandler {
                operation: "create",
                ..
            }
        ));
    }

    #[test]
    fn internal_validate_requires_update_for_updatable_attributes() {
        let resource: Resource<TestBackend> = Resource::new(test_schema())
            .with_create(create_ok)
            .with_read(read_ok)
            .with_delete(delete_ok);
        let err = resource.internal_validate("test_thing").unwrap_err();
        assert!(matches!(
            err,
            SchemaDeclarationError::UpdateHandlerRequired { .. }
        ));
    }

    #[test]
    fn update_not_required_when_every_input_forces_new() {
        let schema = SchemaMap::new()
            .attribute(AttributeSchema::new("name", SchemaType::String).required().force_new())
            .attribute(AttributeSchema::new("id", SchemaType::String).computed());
        let resource: Resource<TestBackend> = Resource::new(schema)
            .with_create(create_ok)
            .with_read(read_ok)
            .with_delete(delete_ok);
        assert!(resource.internal_validate("test_thing").is_ok());
    }

    #[test]
    fn config_get_traverses_nested_paths() {
        let config = ResourceConfig::from_json(serde_json::json!({
            "ingress": [{"port": 80, "cidr": "0.0.0.0/0"}],
            "tags": {"env": "prod"},
        }));

        assert_eq!(config.get("ingress.0.port"), Some(&Value::Int(80)));
        assert_eq!(
            config.get("tags.env"),
            Some(&Value::String("prod".to_string()))
        );
        assert_eq!(config.get("ingress.1.port"), None);
        assert_eq!(config.get("missing"), None);
    }

    #[test]
    fn json_numbers_without_integer_form_become_strings() {
        let v = Value::from(serde_json::json!(1.5));
        assert_eq!(v, Value::String("1.5".to_string()));
    }

    #[test]
    fn unknown_is_detected_inside_containers() {
        let config = ResourceConfig::new().with_attribute(
            "ingress",
            Value::List(vec![Value::Map(BTreeMap::from([(
                "port".to_string(),
                Value::Unknown,
            )]))]),
        );
        assert!(config.is_unknown("ingress"));
        assert!(!config.is_unknown("missing"));
    }

    #[test]
    fn state_round_trips_through_serde() {
        let state = ResourceState::new("test_thing")
            .with_id("r-1")
            .with_attribute("name", "a")
            .with_attribute("ports.#", "1")
            .with_attribute("ports.0", "80");

        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: ResourceState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
    }
}

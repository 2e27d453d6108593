//! In-memory mock provider for exercising the core pipeline
//!
//! Two resource types backed by a process-local store: `mock_app` (simple
//! primitives, a force-new stack, a computed id) and `mock_firewall` (an
//! ingress set hashed by port). Used by the integration tests; not meant
//! for anything else.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use puppis_core::data::ResourceData;
use puppis_core::provider::Provider;
use puppis_core::resource::{CallbackError, CallbackResult, Resource, Value};
use puppis_core::schema::{AttributeSchema, CoercionError, Elem, SchemaMap, SchemaType};

/// One stored object in the fake backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockRecord {
    pub fields: BTreeMap<String, String>,
    /// Firewall rules as (port, cidr).
    pub rules: Vec<(i64, String)>,
}

/// The provider meta: a process-local "cloud". Shared read-only across
/// callbacks, so all mutation goes through interior mutability.
#[derive(Debug)]
pub struct MockCloud {
    pub region: String,
    records: Mutex<HashMap<String, MockRecord>>,
    next_id: AtomicU64,
    fail_next_create: AtomicBool,
}

impl MockCloud {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            fail_next_create: AtomicBool::new(false),
        }
    }

    fn allocate_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}-{n}")
    }

    pub fn put(&self, id: &str, record: MockRecord) {
        self.records.lock().unwrap().insert(id.to_string(), record);
    }

    pub fn get(&self, id: &str) -> Option<MockRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.records.lock().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next create call fail after it has allocated an id,
    /// simulating a half-created remote object.
    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    fn take_create_failure(&self) -> bool {
        self.fail_next_create.swap(false, Ordering::SeqCst)
    }
}

fn write_err(e: CoercionError) -> CallbackError {
    CallbackError::new("failed to write attribute").with_cause(e)
}

fn string_of(v: Value) -> String {
    match v {
        Value::String(s) => s,
        Value::Int(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

// --- mock_app ---

fn app_schema() -> SchemaMap {
    SchemaMap::new()
        .attribute(
            AttributeSchema::new("name", SchemaType::String)
                .required()
                .with_description("Application name"),
        )
        .attribute(
            AttributeSchema::new("region", SchemaType::String)
                .optional()
                .with_default("us-east"),
        )
        .attribute(
            AttributeSchema::new("stack", SchemaType::String)
                .optional()
                .force_new()
                .with_description("Runtime stack; changing it recreates the app"),
        )
        .attribute(AttributeSchema::new("id", SchemaType::String).computed())
}

fn create_app(d: &mut ResourceData, cloud: &MockCloud) -> CallbackResult<()> {
    let id = cloud.allocate_id("app");
    d.set_id(&id);
    if cloud.take_create_failure() {
        return Err(CallbackError::new("backend unavailable"));
    }

    let mut record = MockRecord::default();
    record
        .fields
        .insert("name".to_string(), string_of(d.get("name")));
    record
        .fields
        .insert("region".to_string(), string_of(d.get("region")));
    let (stack, set) = d.get_ok("stack");
    if set {
        record.fields.insert("stack".to_string(), string_of(stack));
    }
    cloud.put(&id, record);

    d.set("id", id.as_str()).map_err(write_err)?;
    Ok(())
}

fn read_app(d: &mut ResourceData, cloud: &MockCloud) -> CallbackResult<()> {
    let id = d.id().to_string();
    let Some(record) = cloud.get(&id) else {
        d.set_id("");
        return Ok(());
    };

    for key in ["name", "region", "stack"] {
        let value = match record.fields.get(key) {
            Some(s) => Value::String(s.clone()),
            None => Value::Null,
        };
        d.set(key, value).map_err(write_err)?;
    }
    d.set("id", id.as_str()).map_err(write_err)?;
    Ok(())
}

fn update_app(d: &mut ResourceData, cloud: &MockCloud) -> CallbackResult<()> {
    let id = d.id().to_string();
    let Some(mut record) = cloud.get(&id) else {
        return Err(CallbackError::new(format!("app {id} is gone")));
    };

    record
        .fields
        .insert("name".to_string(), string_of(d.get("name")));
    record
        .fields
        .insert("region".to_string(), string_of(d.get("region")));
    cloud.put(&id, record);
    Ok(())
}

fn delete_app(d: &mut ResourceData, cloud: &MockCloud) -> CallbackResult<()> {
    cloud.remove(d.id());
    d.set_id("");
    Ok(())
}

pub fn app_resource() -> Resource<MockCloud> {
    Resource::new(app_schema())
        .with_create(create_app)
        .with_read(read_app)
        .with_update(update_app)
        .with_delete(delete_app)
}

// --- mock_firewall ---

/// Ingress rules are identified by port: two rules with the same port are
/// the same rule, whatever their cidr.
fn ingress_hash(v: &Value) -> u64 {
    match v {
        Value::Map(m) => match m.get("port") {
            Some(Value::Int(p)) => *p as u64,
            _ => 0,
        },
        _ => 0,
    }
}

fn firewall_schema() -> SchemaMap {
    SchemaMap::new()
        .attribute(AttributeSchema::new("name", SchemaType::String).required().force_new())
        .attribute(
            AttributeSchema::new("ingress", SchemaType::Set)
                .optional()
                .with_set_hash(ingress_hash)
                .with_elem(Elem::Object(
                    SchemaMap::new()
                        .attribute(AttributeSchema::new("port", SchemaType::Int).required())
                        .attribute(
                            AttributeSchema::new("cidr", SchemaType::String)
                                .optional()
                                .with_default("0.0.0.0/0"),
                        ),
                )),
        )
        .attribute(AttributeSchema::new("id", SchemaType::String).computed())
}

fn rules_from(d: &ResourceData) -> Vec<(i64, String)> {
    let Value::List(items) = d.get("ingress") else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Map(m) => {
                let port = m.get("port").and_then(Value::as_int)?;
                let cidr = m
                    .get("cidr")
                    .and_then(Value::as_str)
                    .unwrap_or("0.0.0.0/0")
                    .to_string();
                Some((port, cidr))
            }
            _ => None,
        })
        .collect()
}

fn rules_value(rules: &[(i64, String)]) -> Value {
    Value::List(
        rules
            .iter()
            .map(|(port, cidr)| {
                Value::Map(BTreeMap::from([
                    ("port".to_string(), Value::Int(*port)),
                    ("cidr".to_string(), Value::String(cidr.clone())),
                ]))
            })
            .collect(),
    )
}

fn create_firewall(d: &mut ResourceData, cloud: &MockCloud) -> CallbackResult<()> {
    let id = cloud.allocate_id("fw");
    let mut record = MockRecord::default();
    record
        .fields
        .insert("name".to_string(), string_of(d.get("name")));
    record.rules = rules_from(d);
    cloud.put(&id, record);

    d.set_id(&id);
    d.set("id", id.as_str()).map_err(write_err)?;
    Ok(())
}

fn read_firewall(d: &mut ResourceData, cloud: &MockCloud) -> CallbackResult<()> {
    let id = d.id().to_string();
    let Some(record) = cloud.get(&id) else {
        d.set_id("");
        return Ok(());
    };

    let name = record.fields.get("name").cloned().unwrap_or_default();
    d.set("name", name).map_err(write_err)?;
    d.set("ingress", rules_value(&record.rules)).map_err(write_err)?;
    d.set("id", id.as_str()).map_err(write_err)?;
    Ok(())
}

fn update_firewall(d: &mut ResourceData, cloud: &MockCloud) -> CallbackResult<()> {
    let id = d.id().to_string();
    let Some(mut record) = cloud.get(&id) else {
        return Err(CallbackError::new(format!("firewall {id} is gone")));
    };
    record.rules = rules_from(d);
    cloud.put(&id, record);
    Ok(())
}

fn delete_firewall(d: &mut ResourceData, cloud: &MockCloud) -> CallbackResult<()> {
    cloud.remove(d.id());
    d.set_id("");
    Ok(())
}

pub fn firewall_resource() -> Resource<MockCloud> {
    Resource::new(firewall_schema())
        .with_create(create_firewall)
        .with_read(read_firewall)
        .with_update(update_firewall)
        .with_delete(delete_firewall)
}

// --- provider ---

fn provider_schema() -> SchemaMap {
    SchemaMap::new()
        .attribute(
            AttributeSchema::new("region", SchemaType::String)
                .optional()
                .with_default("us-east"),
        )
        .attribute(
            AttributeSchema::new("api_key", SchemaType::String)
                .optional()
                .sensitive(),
        )
}

fn configure(d: &mut ResourceData) -> Result<MockCloud, CallbackError> {
    let region = string_of(d.get("region"));
    Ok(MockCloud::new(region))
}

/// Build the mock provider: two resource types over a fresh in-memory
/// backend, configured through the standard lifecycle.
pub fn provider() -> Provider<MockCloud> {
    Provider::new(provider_schema())
        .resource("mock_app", app_resource())
        .resource("mock_firewall", firewall_resource())
        .with_configure(configure)
}

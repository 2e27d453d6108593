//! Provider - bundles resource types with provider-level configuration
//!
//! A provider owns its resource registry and an opaque meta value produced
//! by the configure callback (credentials, client handles). Every engine
//! operation dispatches on the resource type name.

use std::collections::BTreeMap;

use tracing::debug;

use crate::data::ResourceData;
use crate::differ::InstanceDiff;
use crate::resource::{CallbackError, Resource, ResourceConfig, ResourceState};
use crate::schema::{CoercionError, SchemaDeclarationError, SchemaMap, ValidationError};

/// Builds the provider meta from the validated provider configuration.
pub type ConfigureFunc<M> = fn(&mut ResourceData) -> Result<M, CallbackError>;

/// Error surfaced by provider-level operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("resource type not supported: {0}")]
    UnknownResourceType(String),

    #[error("provider is not configured")]
    NotConfigured,

    #[error(transparent)]
    Coercion(#[from] CoercionError),

    #[error(transparent)]
    Callback(#[from] CallbackError),
}

/// A provider: provider-level schema, resource registry, configure
/// callback, and the meta threaded into every CRUD callback.
///
/// Schema and registry are read-only after construction and may be shared
/// across workers; `meta` is written exactly once, by
/// [`configure`](Self::configure), before any resource operation runs.
#[derive(Debug)]
pub struct Provider<M> {
    schema: SchemaMap,
    resources: BTreeMap<String, Resource<M>>,
    configure_func: Option<ConfigureFunc<M>>,
    meta: Option<M>,
}

impl<M> Provider<M> {
    pub fn new(schema: SchemaMap) -> Self {
        Self {
            schema,
            resources: BTreeMap::new(),
            configure_func: None,
            meta: None,
        }
    }

    pub fn resource(mut self, type_name: impl Into<String>, resource: Resource<M>) -> Self {
        self.resources.insert(type_name.into(), resource);
        self
    }

    pub fn with_configure(mut self, f: ConfigureFunc<M>) -> Self {
        self.configure_func = Some(f);
        self
    }

    /// Inject the meta directly, bypassing the configure callback. Meant
    /// for providers without provider-level configuration and for tests.
    pub fn with_meta(mut self, meta: M) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn meta(&self) -> Option<&M> {
        self.meta.as_ref()
    }

    /// Declaration-consistency check over the provider schema and every
    /// registered resource. Run once at startup; failure is fatal.
    pub fn internal_validate(&self) -> Result<(), SchemaDeclarationError> {
        self.schema.internal_validate()?;
        for (type_name, resource) in &self.resources {
            resource.internal_validate(type_name)?;
        }
        Ok(())
    }

    /// Supported resource type names, sorted.
    pub fn resources(&self) -> Vec<String> {
        self.resources.keys().cloned().collect()
    }

    /// Validate the provider-level configuration.
    pub fn validate(&self, config: &ResourceConfig) -> (Vec<String>, Vec<ValidationError>) {
        self.schema.validate(config)
    }

    /// Validate a resource configuration against its declared schema.
    pub fn validate_resource(
        &self,
        type_name: &str,
        config: &ResourceConfig,
    ) -> Result<(Vec<String>, Vec<ValidationError>), CoreError> {
        let resource = self.get_resource(type_name)?;
        Ok(resource.schema.validate(config))
    }

    /// Run the configure callback and stash the meta it returns.
    ///
    /// The config is diffed against an empty state first so that
    /// provider-schema defaults apply before the callback reads it.
    pub fn configure(&mut self, config: &ResourceConfig) -> Result<(), CoreError> {
        let Some(configure) = self.configure_func else {
            return Ok(());
        };
        let state = ResourceState::default();
        let diff = crate::differ::diff(&self.schema, &state, config)?;
        let mut data = ResourceData::new(&self.schema, &state, Some(&diff));
        let meta = configure(&mut data)?;
        self.meta = Some(meta);
        debug!("provider configured");
        Ok(())
    }

    /// Diff prior state against desired configuration for one instance.
    pub fn diff(
        &self,
        state: &ResourceState,
        config: &ResourceConfig,
    ) -> Result<InstanceDiff, CoreError> {
        let resource = self.get_resource(&state.type_name)?;
        Ok(crate::differ::diff(&resource.schema, state, config)?)
    }

    /// Apply a diff to one instance. Returns the new state, `None` when
    /// the instance is gone. A failed callback surfaces as
    /// [`CoreError::Callback`] carrying the partial state to persist.
    pub fn apply(
        &self,
        state: &ResourceState,
        diff: &InstanceDiff,
    ) -> Result<Option<ResourceState>, CoreError> {
        let resource = self.get_resource(&state.type_name)?;
        let meta = self.get_meta()?;
        debug!(
            resource_type = %state.type_name,
            id = %state.id,
            destroy = diff.destroy,
            changes = diff.attributes.len(),
            "applying diff"
        );
        Ok(resource.apply(state, diff, meta)?)
    }

    /// Re-read one instance from the remote system.
    pub fn refresh(&self, state: &ResourceState) -> Result<Option<ResourceState>, CoreError> {
        let resource = self.get_resource(&state.type_name)?;
        let meta = self.get_meta()?;
        debug!(resource_type = %state.type_name, id = %state.id, "refreshing");
        Ok(resource.refresh(state, meta)?)
    }

    fn get_resource(&self, type_name: &str) -> Result<&Resource<M>, CoreError> {
        self.resources
            .get(type_name)
            .ok_or_else(|| CoreError::UnknownResourceType(type_name.to_string()))
    }

    fn get_meta(&self) -> Result<&M, CoreError> {
        self.meta.as_ref().ok_or(CoreError::NotConfigured)
    }
}

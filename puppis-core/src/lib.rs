//! Puppis core - the schema, diff, and apply pipeline
//!
//! Provider authors declare an attribute schema per resource type and get,
//! for free: configuration validation, a structural diff between prior
//! state and desired configuration, typed accessors for CRUD callbacks,
//! and destroy-and-recreate handling for immutable attributes.
//!
//! The flow for one instance in a plan/apply cycle:
//!
//! 1. [`schema::SchemaMap::validate`] checks the raw configuration and
//!    accumulates warnings and errors.
//! 2. [`differ::diff`] compares prior state with the configuration and
//!    yields an [`differ::InstanceDiff`].
//! 3. [`provider::Provider::apply`] dispatches the diff to the resource's
//!    CRUD callbacks, each of which reads and writes through a
//!    [`data::ResourceData`].
//! 4. The buffered writes are materialized into the new
//!    [`resource::ResourceState`] handed back to the caller.
//!
//! The core performs no concurrency and no I/O of its own: every
//! operation is synchronous over its arguments plus the provider's meta.

pub mod data;
pub mod differ;
pub mod flatmap;
pub mod provider;
pub mod resource;
pub mod schema;
pub mod utils;

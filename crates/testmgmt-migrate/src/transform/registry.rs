//! Mapper contract and registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{MigrateError, Result};
use crate::model::{value_as_id, CanonicalEntity, EntityType, NativeEntity, ProjectConfig};

/// Converts one provider's native entities of a single type to and from the
/// canonical form.
///
/// Both directions must be pure: no I/O and no shared mutable state.
pub trait EntityMapper: Send + Sync {
    fn to_canonical(&self, native: &NativeEntity) -> Result<CanonicalEntity>;

    fn from_canonical(&self, canonical: &CanonicalEntity, project: &ProjectConfig) -> Result<NativeEntity>;

    /// Best-effort identifier of a native entity, used to label batch failures.
    fn native_id(&self, native: &NativeEntity) -> Option<String> {
        native.get("id").and_then(value_as_id)
    }
}

/// Mappers keyed by `(provider, entity type)`.
#[derive(Default, Clone)]
pub struct MapperRegistry {
    mappers: HashMap<(String, EntityType), Arc<dyn EntityMapper>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapper, replacing any mapper already registered for the key.
    pub fn register(&mut self, provider: impl Into<String>, entity_type: EntityType, mapper: Arc<dyn EntityMapper>) {
        let provider = provider.into();
        if self
            .mappers
            .insert((provider.clone(), entity_type), mapper)
            .is_some()
        {
            tracing::debug!("Replaced mapper for {}/{}", provider, entity_type);
        }
    }

    pub fn with(mut self, provider: impl Into<String>, entity_type: EntityType, mapper: Arc<dyn EntityMapper>) -> Self {
        self.register(provider, entity_type, mapper);
        self
    }

    pub fn get(&self, provider: &str, entity_type: EntityType) -> Option<&Arc<dyn EntityMapper>> {
        self.mappers.get(&(provider.to_string(), entity_type))
    }

    /// Look up a mapper, failing with [`MigrateError::MapperNotFound`].
    pub fn require(&self, provider: &str, entity_type: EntityType) -> Result<&Arc<dyn EntityMapper>> {
        self.get(provider, entity_type)
            .ok_or_else(|| MigrateError::mapper_not_found(provider, entity_type))
    }

    pub fn contains(&self, provider: &str, entity_type: EntityType) -> bool {
        self.get(provider, entity_type).is_some()
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}

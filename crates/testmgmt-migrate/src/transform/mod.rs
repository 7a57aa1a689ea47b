//! Canonical transformation engine.
//!
//! Native entities go through the canonical form in two steps:
//!
//! 1. [`TransformationEngine::canonicalize`]: source mapper, then the project's
//!    status/priority/field tables, then defaults and step normalization.
//! 2. [`TransformationEngine::render`]: target mapper.
//!
//! The orchestrator runs the two halves separately so it can remap parent and
//! linked ids in between; [`TransformationEngine::transform`] chains them.

pub mod json;
pub mod registry;

pub use json::{JsonLayout, JsonMapper};
pub use registry::{EntityMapper, MapperRegistry};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::model::{CanonicalEntity, EntityType, NativeEntity, ProjectConfig};

/// A canonical entity plus the non-fatal issues found while producing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Canonicalized {
    pub entity: CanonicalEntity,
    pub warnings: Vec<String>,
}

/// Output of a full source-to-target transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformed {
    pub native: NativeEntity,
    pub canonical: CanonicalEntity,
    pub warnings: Vec<String>,
}

/// All three representations of one entity, for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformPreview {
    pub source_form: NativeEntity,
    pub canonical_form: CanonicalEntity,
    pub target_form: NativeEntity,
    pub warnings: Vec<String>,
}

/// One successfully transformed batch item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub item_id: String,
    pub native: NativeEntity,
    pub warnings: Vec<String>,
}

/// One batch item that could not be transformed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub item_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub transformed: Vec<BatchItem>,
    pub failed: Vec<BatchFailure>,
}

/// Stateless transformation service over an injected [`MapperRegistry`].
#[derive(Clone, Default)]
pub struct TransformationEngine {
    registry: MapperRegistry,
}

impl TransformationEngine {
    pub fn new(registry: MapperRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &MapperRegistry {
        &self.registry
    }

    /// Register a mapper, replacing any previous one for the same key.
    pub fn register(&mut self, provider: impl Into<String>, entity_type: EntityType, mapper: Arc<dyn EntityMapper>) {
        self.registry.register(provider, entity_type, mapper);
    }

    /// Fail unless both systems have a mapper for `entity_type`.
    pub fn ensure_mappers(&self, source_system: &str, target_system: &str, entity_type: EntityType) -> Result<()> {
        self.registry.require(source_system, entity_type)?;
        self.registry.require(target_system, entity_type)?;
        Ok(())
    }

    /// Convert a source-native entity into its canonical form.
    pub fn canonicalize(
        &self,
        input: &NativeEntity,
        entity_type: EntityType,
        source_system: &str,
        project: &ProjectConfig,
    ) -> Result<Canonicalized> {
        let mapper = self.registry.require(source_system, entity_type)?;
        let mut entity = mapper.to_canonical(input)?;
        entity.entity_type = entity_type;

        let mut warnings = Vec::new();
        entity.status = map_value("status", entity.status.take(), &project.status_mappings, &mut warnings);
        entity.priority = map_value("priority", entity.priority.take(), &project.priority_mappings, &mut warnings);
        map_custom_fields(&mut entity, &project.field_mappings, &mut warnings);

        for field in entity.apply_defaults() {
            let value = match field {
                "status" => entity.status.as_deref(),
                _ => entity.priority.as_deref(),
            };
            warnings.push(format!("{} missing, defaulted to {}", field, value.unwrap_or_default()));
        }

        if !entity.steps_are_contiguous() {
            entity.normalize_steps();
            warnings.push("step sequence renumbered to 1..n".to_string());
        }

        debug!(
            "Canonicalized {} {} from {} ({} warnings)",
            entity_type,
            entity.source_id,
            source_system,
            warnings.len()
        );
        Ok(Canonicalized { entity, warnings })
    }

    /// Render a canonical entity in the target's native form.
    pub fn render(&self, target_system: &str, canonical: &CanonicalEntity, project: &ProjectConfig) -> Result<NativeEntity> {
        self.registry
            .require(target_system, canonical.entity_type)?
            .from_canonical(canonical, project)
    }

    /// Source-native to target-native.
    pub fn transform(
        &self,
        input: &NativeEntity,
        entity_type: EntityType,
        source_system: &str,
        target_system: &str,
        project: &ProjectConfig,
    ) -> Result<Transformed> {
        // Surface a missing target mapper before doing any work.
        self.registry.require(target_system, entity_type)?;

        let Canonicalized { entity, warnings } = self.canonicalize(input, entity_type, source_system, project)?;
        let native = self.render(target_system, &entity, project)?;
        Ok(Transformed {
            native,
            canonical: entity,
            warnings,
        })
    }

    /// Same pipeline as [`transform`](Self::transform), returning every stage.
    pub fn preview(
        &self,
        input: &NativeEntity,
        entity_type: EntityType,
        source_system: &str,
        target_system: &str,
        project: &ProjectConfig,
    ) -> Result<TransformPreview> {
        let transformed = self.transform(input, entity_type, source_system, target_system, project)?;
        Ok(TransformPreview {
            source_form: input.clone(),
            canonical_form: transformed.canonical,
            target_form: transformed.native,
            warnings: transformed.warnings,
        })
    }

    /// Transform every input independently; failures never abort the batch.
    pub fn transform_batch(
        &self,
        inputs: &[NativeEntity],
        entity_type: EntityType,
        source_system: &str,
        target_system: &str,
        project: &ProjectConfig,
    ) -> BatchOutcome {
        let source_mapper = self.registry.get(source_system, entity_type);
        let mut outcome = BatchOutcome::default();

        for (index, input) in inputs.iter().enumerate() {
            let item_id = source_mapper
                .and_then(|m| m.native_id(input))
                .unwrap_or_else(|| format!("#{}", index));

            match self.transform(input, entity_type, source_system, target_system, project) {
                Ok(t) => outcome.transformed.push(BatchItem {
                    item_id,
                    native: t.native,
                    warnings: t.warnings,
                }),
                Err(e) => {
                    debug!("Batch item {} failed: {}", item_id, e);
                    outcome.failed.push(BatchFailure {
                        item_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        outcome
    }
}

fn map_value(
    field: &str,
    value: Option<String>,
    table: &BTreeMap<String, String>,
    warnings: &mut Vec<String>,
) -> Option<String> {
    let value = value.filter(|v| !v.is_empty())?;
    match table.get(&value) {
        Some(mapped) => Some(mapped.clone()),
        None => {
            warnings.push(format!("{} '{}' has no mapping, passed through", field, value));
            Some(value)
        }
    }
}

fn map_custom_fields(entity: &mut CanonicalEntity, table: &BTreeMap<String, String>, warnings: &mut Vec<String>) {
    if entity.custom_fields.is_empty() {
        return;
    }
    let fields = std::mem::take(&mut entity.custom_fields);
    for (name, value) in fields {
        match table.get(&name) {
            Some(target) => {
                entity.custom_fields.insert(target.clone(), value);
            }
            None => warnings.push(format!("custom field '{}' has no mapping, dropped", name)),
        }
    }
}

//! Operation dependency planning.
//!
//! - [`operation`]: operation types, definitions and invocation instances
//! - [`graph`]: the [`DependencyGraph`] resolver (ordering, minimal sets, validation)
//! - [`catalog`]: capability-derived operation catalogs
//!
//! [`MigrationPlan`] ties the source and target graphs together into the
//! ordered list of entity types a job migrates.

pub mod catalog;
pub mod graph;
pub mod operation;

pub use catalog::OperationCatalog;
pub use graph::{DependencyGraph, GraphSnapshot};
pub use operation::{OperationDefinition, OperationInstance, OperationType, ValidationReport};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MigrateError, Result};
use crate::model::EntityType;
use crate::provider::{ProviderCapabilities, ProviderRole};

/// Ordered execution plan for one migration job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Source operations to run, in dependency order.
    pub source_operations: Vec<OperationType>,
    /// Target operations to run, in dependency order.
    pub target_operations: Vec<OperationType>,
    /// Entity types in the order they are migrated.
    pub entity_order: Vec<EntityType>,
    /// Whether attachment binaries are copied alongside test cases.
    pub attachments: bool,
}

impl MigrationPlan {
    /// Plan the migration of `requested` entity types between two providers.
    ///
    /// Entity types that either side cannot handle are skipped with a
    /// warning; a plan with nothing left to migrate is a validation error.
    pub fn build(
        source: &ProviderCapabilities,
        target: &ProviderCapabilities,
        requested: &[EntityType],
    ) -> Result<Self> {
        if !source.can_be_source {
            return Err(MigrateError::validation("source provider cannot act as a source"));
        }
        if !target.can_be_target {
            return Err(MigrateError::validation("target provider cannot act as a target"));
        }

        let source_graph = OperationCatalog::graph(source, ProviderRole::Source)?;
        let target_graph = OperationCatalog::graph(target, ProviderRole::Target)?;

        let mut fetch_goals = Vec::new();
        let mut create_goals = Vec::new();
        for entity_type in requested {
            let fetch = OperationType::fetch_for(*entity_type).filter(|op| source_graph.contains(*op));
            let create = OperationType::create_for(*entity_type).filter(|op| target_graph.contains(*op));
            match (fetch, create) {
                (Some(f), Some(c)) => {
                    fetch_goals.push(f);
                    create_goals.push(c);
                }
                _ => warn!(
                    "Skipping {}: not supported by both source and target capabilities",
                    entity_type
                ),
            }
        }

        if create_goals.is_empty() {
            return Err(MigrateError::validation(
                "no requested entity type is supported by both providers",
            ));
        }

        let attachments = source.supports_attachments
            && target.supports_attachments
            && create_goals.contains(&OperationType::CreateTestCase);
        if attachments {
            fetch_goals.push(OperationType::GetAttachments);
            create_goals.push(OperationType::UploadAttachment);
        }

        let source_operations = source_graph.minimal_operation_set_for(&fetch_goals)?;
        let target_operations = target_graph.minimal_operation_set_for(&create_goals)?;

        let entity_order: Vec<EntityType> = target_operations
            .iter()
            .filter_map(|op| op.creates())
            .filter(|t| requested.contains(t))
            .collect();

        info!(
            "Planned migration of {:?} ({} source ops, {} target ops, attachments: {})",
            entity_order,
            source_operations.len(),
            target_operations.len(),
            attachments
        );

        Ok(Self {
            source_operations,
            target_operations,
            entity_order,
            attachments,
        })
    }
}

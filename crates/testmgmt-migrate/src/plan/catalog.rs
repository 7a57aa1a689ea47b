//! Static operation catalog derived from provider capabilities.
//!
//! The catalog never looks at provider names: what a provider can do is read
//! entirely from its declared [`ProviderCapabilities`].

use crate::error::Result;
use crate::model::EntityType;
use crate::provider::{ProviderCapabilities, ProviderRole};

use super::graph::DependencyGraph;
use super::operation::{OperationDefinition, OperationType};

/// Builds the operation definitions available to one provider.
pub struct OperationCatalog;

impl OperationCatalog {
    /// Operation definitions for a provider acting in `role`.
    pub fn for_capabilities(
        caps: &ProviderCapabilities,
        role: ProviderRole,
    ) -> Vec<OperationDefinition> {
        use OperationType::*;

        let mut ops = vec![
            OperationDefinition::new(Authenticate).cost_ms(250),
            OperationDefinition::new(GetProject)
                .depends_on([Authenticate])
                .requires_params(["project_id"])
                .cost_ms(150),
        ];

        match role {
            ProviderRole::Source => {
                if !caps.can_be_source {
                    return ops;
                }
                if caps.handles(EntityType::Folder) {
                    ops.push(
                        OperationDefinition::new(GetFolders)
                            .depends_on([GetProject])
                            .optional()
                            .cost_ms(200),
                    );
                }
                if caps.handles(EntityType::TestCase) {
                    ops.push(
                        OperationDefinition::new(GetTestCases)
                            .depends_on([GetProject])
                            .requires_params(["project_id"])
                            .cost_ms(500),
                    );
                    if caps.supports_attachments {
                        ops.push(
                            OperationDefinition::new(GetAttachments)
                                .depends_on([GetTestCases])
                                .optional()
                                .cost_ms(1_000),
                        );
                    }
                }
                if caps.handles(EntityType::TestCycle) {
                    ops.push(
                        OperationDefinition::new(GetTestCycles)
                            .depends_on([GetProject])
                            .cost_ms(300),
                    );
                }
                if caps.supports_execution_history
                    && caps.handles(EntityType::TestExecution)
                    && caps.handles(EntityType::TestCase)
                    && caps.handles(EntityType::TestCycle)
                {
                    ops.push(
                        OperationDefinition::new(GetTestExecutions)
                            .depends_on([GetTestCases, GetTestCycles])
                            .cost_ms(800),
                    );
                }
            }
            ProviderRole::Target => {
                if !caps.can_be_target {
                    return ops;
                }
                let folders = caps.handles(EntityType::Folder);
                if folders {
                    ops.push(
                        OperationDefinition::new(CreateFolder)
                            .depends_on([GetProject])
                            .optional()
                            .requires_params(["project_id"])
                            .cost_ms(200),
                    );
                }
                if caps.handles(EntityType::TestCase) {
                    let mut create = OperationDefinition::new(CreateTestCase)
                        .depends_on([Authenticate, GetProject])
                        .requires_params(["project_id"])
                        .cost_ms(400);
                    if folders {
                        create = create.depends_on([CreateFolder]);
                    }
                    ops.push(create);

                    if caps.supports_attachments {
                        ops.push(
                            OperationDefinition::new(UploadAttachment)
                                .depends_on([CreateTestCase])
                                .optional()
                                .cost_ms(1_000),
                        );
                    }

                    if caps.handles(EntityType::TestCycle) {
                        ops.push(
                            OperationDefinition::new(CreateTestCycle)
                                .depends_on([CreateTestCase])
                                .requires_params(["project_id"])
                                .cost_ms(300),
                        );
                        if caps.supports_execution_history && caps.handles(EntityType::TestExecution) {
                            ops.push(
                                OperationDefinition::new(CreateTestExecution)
                                    .depends_on([CreateTestCase, CreateTestCycle])
                                    .cost_ms(800),
                            );
                        }
                    }
                }
            }
        }

        ops
    }

    /// Dependency graph for a provider acting in `role`.
    pub fn graph(caps: &ProviderCapabilities, role: ProviderRole) -> Result<DependencyGraph> {
        DependencyGraph::build(Self::for_capabilities(caps, role))
    }
}

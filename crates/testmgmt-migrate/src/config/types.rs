//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{EntityType, ProjectConfig};
use crate::ratelimit::RateLimitConfig;

/// Root configuration of one migration job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Provider and project entities are read from.
    pub source: EndpointConfig,

    /// Provider and project entities are written to.
    pub target: EndpointConfig,

    /// Field, status and priority mapping tables.
    #[serde(default)]
    pub project: ProjectConfig,

    /// Execution settings.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Per-provider throttle policies, by provider name.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
}

/// One side of a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Registered provider name (`zephyr`, `qtest`, ...).
    pub provider: String,

    /// Project id inside that provider.
    pub project_id: String,
}

/// Execution settings.
///
/// Every field is optional; the `get_*` accessors supply defaults, so an
/// unspecified value stays distinguishable from an explicit one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Concurrent entity workers per job.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Retries per entity after the first attempt.
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// First retry delay; doubles per attempt.
    #[serde(default)]
    pub retry_base_delay_ms: Option<u64>,

    /// Ceiling for the retry delay.
    #[serde(default)]
    pub retry_max_delay_ms: Option<u64>,

    /// Consecutive entity failures that mark the target unreachable and fail the job.
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,

    /// Per adapter call timeout. Unset means no timeout.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,

    /// Entity types to migrate.
    #[serde(default)]
    pub entity_types: Option<Vec<EntityType>>,
}

impl MigrationConfig {
    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }

    pub fn get_retry_base_delay_ms(&self) -> u64 {
        self.retry_base_delay_ms.unwrap_or(500)
    }

    pub fn get_retry_max_delay_ms(&self) -> u64 {
        self.retry_max_delay_ms.unwrap_or(30_000)
    }

    pub fn get_max_consecutive_failures(&self) -> u32 {
        self.max_consecutive_failures.unwrap_or(10)
    }

    pub fn get_entity_types(&self) -> Vec<EntityType> {
        self.entity_types.clone().unwrap_or_else(|| {
            vec![
                EntityType::Folder,
                EntityType::TestCase,
                EntityType::TestCycle,
                EntityType::TestExecution,
            ]
        })
    }
}

impl Config {
    /// Build a config with default execution settings.
    pub fn new(source: EndpointConfig, target: EndpointConfig) -> Self {
        Self {
            source,
            target,
            project: ProjectConfig::default(),
            migration: MigrationConfig::default(),
            rate_limits: BTreeMap::new(),
        }
    }

    /// Mapping tables with project ids filled in from the endpoints.
    pub fn project_config(&self) -> ProjectConfig {
        let mut project = self.project.clone();
        if project.source_project_id.is_empty() {
            project.source_project_id = self.source.project_id.clone();
        }
        if project.target_project_id.is_empty() {
            project.target_project_id = self.target.project_id.clone();
        }
        project
    }
}

impl EndpointConfig {
    pub fn new(provider: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            project_id: project_id.into(),
        }
    }
}

//! Per-project mapping tables owned by a migration job.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field and value mapping between a source and a target project.
///
/// Read-only while a job runs. `BTreeMap` keeps the serialized form (and so
/// the config hash) stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub source_project_id: String,
    #[serde(default)]
    pub target_project_id: String,

    /// Custom field name in the source -> custom field name in the target.
    #[serde(default)]
    pub field_mappings: BTreeMap<String, String>,

    /// Source status value -> target status value.
    #[serde(default)]
    pub status_mappings: BTreeMap<String, String>,

    /// Source priority value -> target priority value.
    #[serde(default)]
    pub priority_mappings: BTreeMap<String, String>,
}

impl ProjectConfig {
    pub fn new(source_project_id: impl Into<String>, target_project_id: impl Into<String>) -> Self {
        Self {
            source_project_id: source_project_id.into(),
            target_project_id: target_project_id.into(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.field_mappings.insert(source.into(), target.into());
        self
    }

    pub fn with_status(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.status_mappings.insert(source.into(), target.into());
        self
    }

    pub fn with_priority(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.priority_mappings.insert(source.into(), target.into());
        self
    }

    /// Mapping tables with the source and target sides swapped.
    ///
    /// Duplicate target values keep the last source key.
    pub fn reversed(&self) -> Self {
        fn flip(map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
            map.iter().map(|(k, v)| (v.clone(), k.clone())).collect()
        }

        Self {
            source_project_id: self.target_project_id.clone(),
            target_project_id: self.source_project_id.clone(),
            field_mappings: flip(&self.field_mappings),
            status_mappings: flip(&self.status_mappings),
            priority_mappings: flip(&self.priority_mappings),
        }
    }
}

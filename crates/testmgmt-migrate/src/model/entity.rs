//! Canonical (provider-neutral) entity representation.
//!
//! Every provider entity is converted to a [`CanonicalEntity`] on the way in
//! and rendered from one on the way out, so adding a provider only requires a
//! pair of mappers rather than one per provider combination.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MigrateError;

/// Status assigned when the source entity carries none.
pub const DEFAULT_STATUS: &str = "DRAFT";

/// Priority assigned when the source entity carries none.
pub const DEFAULT_PRIORITY: &str = "MEDIUM";

/// Provider-native entity payload.
pub type NativeEntity = serde_json::Value;

/// Kinds of test-management assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Project,
    Folder,
    TestCase,
    TestStep,
    TestCycle,
    TestExecution,
    Attachment,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        EntityType::Project,
        EntityType::Folder,
        EntityType::TestCase,
        EntityType::TestStep,
        EntityType::TestCycle,
        EntityType::TestExecution,
        EntityType::Attachment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Project => "project",
            EntityType::Folder => "folder",
            EntityType::TestCase => "test_case",
            EntityType::TestStep => "test_step",
            EntityType::TestCycle => "test_cycle",
            EntityType::TestExecution => "test_execution",
            EntityType::Attachment => "attachment",
        }
    }

    /// Kind of entity a `parent_id` of this kind refers to.
    pub fn parent_type(&self) -> Option<EntityType> {
        match self {
            EntityType::Folder | EntityType::TestCase | EntityType::TestCycle => Some(EntityType::Folder),
            EntityType::TestExecution => Some(EntityType::TestCycle),
            EntityType::TestStep | EntityType::Attachment => Some(EntityType::TestCase),
            EntityType::Project => None,
        }
    }

    /// Kind of entity the `linked_ids` of this kind refer to.
    pub fn link_type(&self) -> Option<EntityType> {
        match self {
            EntityType::TestCycle | EntityType::TestExecution => Some(EntityType::TestCase),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MigrateError::validation(format!("unknown entity type '{}'", s)))
    }
}

/// A single step of a test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    /// 1-based, contiguous position within the owning test case.
    pub sequence: u32,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Attachment metadata; the binary lives behind `storage_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub file_name: String,
    pub storage_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Provider-agnostic test-management entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub entity_type: EntityType,

    /// Id in the source system; retained through every hop.
    pub source_id: String,

    /// Id assigned by the target system once pushed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<TestStep>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub custom_fields: IndexMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,

    /// Containing folder, cycle, or project (source id until remapped).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Related entities, e.g. the test case an execution ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CanonicalEntity {
    pub fn new(entity_type: EntityType, source_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            entity_type,
            source_id: source_id.into(),
            target_id: None,
            name: name.into(),
            description: None,
            status: None,
            priority: None,
            steps: Vec::new(),
            custom_fields: IndexMap::new(),
            attachments: Vec::new(),
            parent_id: None,
            linked_ids: Vec::new(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Checkpoint key, unique within a job.
    pub fn key(&self) -> String {
        entity_key(self.entity_type, &self.source_id)
    }

    /// Fill missing status/priority. Returns the names of defaulted fields.
    pub fn apply_defaults(&mut self) -> Vec<&'static str> {
        let mut defaulted = Vec::new();
        if self.status.as_deref().map_or(true, str::is_empty) {
            self.status = Some(DEFAULT_STATUS.to_string());
            defaulted.push("status");
        }
        if self.priority.as_deref().map_or(true, str::is_empty) {
            self.priority = Some(DEFAULT_PRIORITY.to_string());
            defaulted.push("priority");
        }
        defaulted
    }

    /// Sort steps by their declared sequence and renumber them 1..=n.
    pub fn normalize_steps(&mut self) {
        self.steps.sort_by_key(|s| s.sequence);
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.sequence = i as u32 + 1;
        }
    }

    /// True when step sequences are exactly 1..=n.
    pub fn steps_are_contiguous(&self) -> bool {
        self.steps
            .iter()
            .enumerate()
            .all(|(i, s)| s.sequence == i as u32 + 1)
    }
}

/// Read a JSON scalar as an id string.
pub fn value_as_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Build the checkpoint key for an entity.
pub fn entity_key(entity_type: EntityType, source_id: &str) -> String {
    format!("{}:{}", entity_type, source_id)
}

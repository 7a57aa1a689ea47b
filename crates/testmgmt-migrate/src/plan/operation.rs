//! Provider operation types and their static definitions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::MigrateError;
use crate::model::EntityType;

/// A provider operation the orchestrator can plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Authenticate,
    GetProject,
    GetFolders,
    GetTestCases,
    GetTestCycles,
    GetTestExecutions,
    GetAttachments,
    CreateFolder,
    CreateTestCase,
    CreateTestCycle,
    CreateTestExecution,
    UploadAttachment,
}

impl OperationType {
    pub const ALL: [OperationType; 12] = [
        OperationType::Authenticate,
        OperationType::GetProject,
        OperationType::GetFolders,
        OperationType::GetTestCases,
        OperationType::GetTestCycles,
        OperationType::GetTestExecutions,
        OperationType::GetAttachments,
        OperationType::CreateFolder,
        OperationType::CreateTestCase,
        OperationType::CreateTestCycle,
        OperationType::CreateTestExecution,
        OperationType::UploadAttachment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Authenticate => "authenticate",
            OperationType::GetProject => "get_project",
            OperationType::GetFolders => "get_folders",
            OperationType::GetTestCases => "get_test_cases",
            OperationType::GetTestCycles => "get_test_cycles",
            OperationType::GetTestExecutions => "get_test_executions",
            OperationType::GetAttachments => "get_attachments",
            OperationType::CreateFolder => "create_folder",
            OperationType::CreateTestCase => "create_test_case",
            OperationType::CreateTestCycle => "create_test_cycle",
            OperationType::CreateTestExecution => "create_test_execution",
            OperationType::UploadAttachment => "upload_attachment",
        }
    }

    /// Entity type this operation reads from a source, if any.
    pub fn fetches(&self) -> Option<EntityType> {
        match self {
            OperationType::GetFolders => Some(EntityType::Folder),
            OperationType::GetTestCases => Some(EntityType::TestCase),
            OperationType::GetTestCycles => Some(EntityType::TestCycle),
            OperationType::GetTestExecutions => Some(EntityType::TestExecution),
            _ => None,
        }
    }

    /// Entity type this operation writes to a target, if any.
    ///
    /// Attachments travel with their test case and are not planned as
    /// standalone entities.
    pub fn creates(&self) -> Option<EntityType> {
        match self {
            OperationType::CreateFolder => Some(EntityType::Folder),
            OperationType::CreateTestCase => Some(EntityType::TestCase),
            OperationType::CreateTestCycle => Some(EntityType::TestCycle),
            OperationType::CreateTestExecution => Some(EntityType::TestExecution),
            _ => None,
        }
    }

    pub fn fetch_for(entity_type: EntityType) -> Option<OperationType> {
        OperationType::ALL
            .iter()
            .copied()
            .find(|op| op.fetches() == Some(entity_type))
    }

    pub fn create_for(entity_type: EntityType) -> Option<OperationType> {
        OperationType::ALL
            .iter()
            .copied()
            .find(|op| op.creates() == Some(entity_type))
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationType::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| MigrateError::validation(format!("unknown operation '{}'", s)))
    }
}

/// Static description of an operation and its prerequisites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDefinition {
    pub op_type: OperationType,

    #[serde(default)]
    pub dependencies: BTreeSet<OperationType>,

    #[serde(default = "default_true")]
    pub required: bool,

    /// Parameter names that must be present in an invocation context.
    #[serde(default)]
    pub required_params: Vec<String>,

    #[serde(with = "duration_ms", default)]
    pub estimated_cost: Duration,
}

impl OperationDefinition {
    pub fn new(op_type: OperationType) -> Self {
        Self {
            op_type,
            dependencies: BTreeSet::new(),
            required: true,
            required_params: Vec::new(),
            estimated_cost: Duration::ZERO,
        }
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = OperationType>) -> Self {
        self.dependencies.extend(deps);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn requires_params<S: Into<String>>(mut self, params: impl IntoIterator<Item = S>) -> Self {
        self.required_params.extend(params.into_iter().map(Into::into));
        self
    }

    pub fn cost_ms(mut self, ms: u64) -> Self {
        self.estimated_cost = Duration::from_millis(ms);
        self
    }
}

/// A concrete invocation of an operation, checked by `validate_operations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInstance {
    pub op_type: OperationType,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl OperationInstance {
    pub fn new(op_type: OperationType) -> Self {
        Self {
            op_type,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Outcome of validating a submitted operation sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

fn default_true() -> bool {
    true
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_round_trips_through_str() {
        for op in OperationType::ALL {
            assert_eq!(op.as_str().parse::<OperationType>().unwrap(), op);
        }
        assert!("delete_everything".parse::<OperationType>().is_err());
    }

    #[test]
    fn test_entity_lookup() {
        assert_eq!(
            OperationType::create_for(EntityType::TestCase),
            Some(OperationType::CreateTestCase)
        );
        assert_eq!(
            OperationType::fetch_for(EntityType::TestExecution),
            Some(OperationType::GetTestExecutions)
        );
        assert_eq!(OperationType::create_for(EntityType::Attachment), None);
    }

    #[test]
    fn test_definition_yaml_uses_millis() {
        let def = OperationDefinition::new(OperationType::GetProject)
            .depends_on([OperationType::Authenticate])
            .requires_params(["project_id"])
            .cost_ms(150);

        let yaml = serde_yaml::to_string(&def).unwrap();
        assert!(yaml.contains("estimated_cost: 150"));

        let parsed: OperationDefinition = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, def);
    }
}

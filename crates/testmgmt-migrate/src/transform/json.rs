//! Declarative mapper for JSON-shaped provider payloads.
//!
//! Most provider REST payloads differ only in where each canonical field
//! lives. A [`JsonLayout`] names those locations (dotted paths such as
//! `fields.summary`) and [`JsonMapper`] converts in both directions.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MigrateError, Result};
use crate::model::{value_as_id, AttachmentRef, CanonicalEntity, EntityType, NativeEntity, ProjectConfig, TestStep};

use super::EntityMapper;

/// Where each canonical field lives in a provider payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonLayout {
    /// The entity's own id in this provider.
    pub id: String,
    /// Id of the entity this one was migrated from, written on push.
    pub source_ref: String,
    pub name: String,
    pub description: String,
    pub status: String,
    pub priority: String,
    pub steps: String,
    pub step_sequence: String,
    pub step_action: String,
    pub step_expected: String,
    pub step_data: String,
    /// Object holding custom fields by name.
    pub custom_fields: String,
    pub attachments: String,
    pub parent: String,
    pub links: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Default for JsonLayout {
    fn default() -> Self {
        Self {
            id: "id".into(),
            source_ref: "source_id".into(),
            name: "name".into(),
            description: "description".into(),
            status: "status".into(),
            priority: "priority".into(),
            steps: "steps".into(),
            step_sequence: "sequence".into(),
            step_action: "action".into(),
            step_expected: "expected_result".into(),
            step_data: "data".into(),
            custom_fields: "custom_fields".into(),
            attachments: "attachments".into(),
            parent: "parent_id".into(),
            links: "linked_ids".into(),
            created_at: "created_at".into(),
            updated_at: "updated_at".into(),
        }
    }
}

/// [`EntityMapper`] driven by a [`JsonLayout`].
#[derive(Debug, Clone)]
pub struct JsonMapper {
    entity_type: EntityType,
    layout: JsonLayout,
}

impl JsonMapper {
    pub fn new(entity_type: EntityType, layout: JsonLayout) -> Self {
        Self { entity_type, layout }
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn layout(&self) -> &JsonLayout {
        &self.layout
    }

    fn string_at(&self, native: &Value, path: &str) -> Option<String> {
        match get_path(native, path)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn timestamp_at(&self, native: &Value, path: &str) -> Result<Option<DateTime<Utc>>> {
        match self.string_at(native, path) {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|ts| Some(ts.with_timezone(&Utc)))
                .map_err(|e| MigrateError::validation(format!("invalid timestamp in '{}': {}", path, e))),
        }
    }

    fn steps_from(&self, native: &Value) -> Result<Vec<TestStep>> {
        let Some(raw) = get_path(native, &self.layout.steps) else {
            return Ok(Vec::new());
        };
        let items = raw
            .as_array()
            .ok_or_else(|| MigrateError::validation(format!("'{}' must be an array", self.layout.steps)))?;

        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let action = self.string_at(item, &self.layout.step_action).ok_or_else(|| {
                    MigrateError::validation(format!("step {} has no '{}'", i + 1, self.layout.step_action))
                })?;
                let sequence = get_path(item, &self.layout.step_sequence)
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(i as u32 + 1);
                Ok(TestStep {
                    sequence,
                    action,
                    expected_result: self.string_at(item, &self.layout.step_expected),
                    data: self.string_at(item, &self.layout.step_data),
                })
            })
            .collect()
    }

    fn step_to_native(&self, step: &TestStep) -> Value {
        let mut out = Value::Object(Map::new());
        set_path(&mut out, &self.layout.step_sequence, Value::from(step.sequence));
        set_path(&mut out, &self.layout.step_action, Value::String(step.action.clone()));
        if let Some(expected) = &step.expected_result {
            set_path(&mut out, &self.layout.step_expected, Value::String(expected.clone()));
        }
        if let Some(data) = &step.data {
            set_path(&mut out, &self.layout.step_data, Value::String(data.clone()));
        }
        out
    }
}

impl EntityMapper for JsonMapper {
    fn to_canonical(&self, native: &NativeEntity) -> Result<CanonicalEntity> {
        if !native.is_object() {
            return Err(MigrateError::validation(format!(
                "{} payload must be a JSON object",
                self.entity_type
            )));
        }

        let source_id = self
            .string_at(native, &self.layout.source_ref)
            .or_else(|| self.string_at(native, &self.layout.id))
            .ok_or_else(|| MigrateError::validation(format!("missing required field '{}'", self.layout.id)))?;
        let name = self
            .string_at(native, &self.layout.name)
            .ok_or_else(|| MigrateError::validation(format!("missing required field '{}'", self.layout.name)))?;

        let mut entity = CanonicalEntity::new(self.entity_type, source_id, name);
        entity.description = self.string_at(native, &self.layout.description);
        entity.status = self.string_at(native, &self.layout.status);
        entity.priority = self.string_at(native, &self.layout.priority);
        entity.steps = self.steps_from(native)?;
        entity.parent_id = self.string_at(native, &self.layout.parent);
        entity.created_at = self.timestamp_at(native, &self.layout.created_at)?;
        entity.updated_at = self.timestamp_at(native, &self.layout.updated_at)?;

        if let Some(Value::Object(fields)) = get_path(native, &self.layout.custom_fields) {
            entity.custom_fields = fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<IndexMap<_, _>>();
        }
        if let Some(raw) = get_path(native, &self.layout.attachments) {
            entity.attachments = serde_json::from_value(raw.clone())?;
        }
        if let Some(Value::Array(links)) = get_path(native, &self.layout.links) {
            entity.linked_ids = links.iter().filter_map(value_as_id).collect();
        }

        Ok(entity)
    }

    fn from_canonical(&self, canonical: &CanonicalEntity, _project: &ProjectConfig) -> Result<NativeEntity> {
        let mut out = Value::Object(Map::new());
        let layout = &self.layout;

        if let Some(target_id) = &canonical.target_id {
            set_path(&mut out, &layout.id, Value::String(target_id.clone()));
        }
        set_path(&mut out, &layout.source_ref, Value::String(canonical.source_id.clone()));
        set_path(&mut out, &layout.name, Value::String(canonical.name.clone()));

        let optional = [
            (&layout.description, &canonical.description),
            (&layout.status, &canonical.status),
            (&layout.priority, &canonical.priority),
            (&layout.parent, &canonical.parent_id),
        ];
        for (path, value) in optional {
            if let Some(v) = value {
                set_path(&mut out, path, Value::String(v.clone()));
            }
        }

        if !canonical.steps.is_empty() {
            let steps = canonical.steps.iter().map(|s| self.step_to_native(s)).collect();
            set_path(&mut out, &layout.steps, Value::Array(steps));
        }
        if !canonical.custom_fields.is_empty() {
            let fields: Map<String, Value> = canonical
                .custom_fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            set_path(&mut out, &layout.custom_fields, Value::Object(fields));
        }
        if !canonical.attachments.is_empty() {
            set_path(&mut out, &layout.attachments, attachments_value(&canonical.attachments)?);
        }
        if !canonical.linked_ids.is_empty() {
            let links = canonical.linked_ids.iter().cloned().map(Value::String).collect();
            set_path(&mut out, &layout.links, Value::Array(links));
        }
        if let Some(ts) = canonical.created_at {
            set_path(&mut out, &layout.created_at, Value::String(ts.to_rfc3339()));
        }
        if let Some(ts) = canonical.updated_at {
            set_path(&mut out, &layout.updated_at, Value::String(ts.to_rfc3339()));
        }

        Ok(out)
    }

    fn native_id(&self, native: &NativeEntity) -> Option<String> {
        self.string_at(native, &self.layout.id)
    }
}

fn attachments_value(attachments: &[AttachmentRef]) -> Result<Value> {
    Ok(serde_json::to_value(attachments)?)
}

/// Resolve a dotted path inside a JSON value.
pub(crate) fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

/// Write `new` at a dotted path, creating intermediate objects.
pub(crate) fn set_path(value: &mut Value, path: &str, new: Value) {
    if path.is_empty() {
        return;
    }
    let mut current = value;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else { return };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), new);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn jira_layout() -> JsonLayout {
        JsonLayout {
            id: "key".into(),
            source_ref: "fields.migratedFrom".into(),
            name: "fields.summary".into(),
            status: "fields.status.name".into(),
            steps: "fields.steps".into(),
            step_sequence: "index".into(),
            step_action: "step".into(),
            step_expected: "result".into(),
            custom_fields: "fields.custom".into(),
            ..JsonLayout::default()
        }
    }

    #[test]
    fn test_nested_paths_read_and_write() {
        let mut value = json!({});
        set_path(&mut value, "fields.status.name", json!("Open"));
        set_path(&mut value, "fields.summary", json!("Login"));
        assert_eq!(value, json!({"fields": {"status": {"name": "Open"}, "summary": "Login"}}));
        assert_eq!(get_path(&value, "fields.status.name"), Some(&json!("Open")));
        assert_eq!(get_path(&value, "fields.missing"), None);
    }

    #[test]
    fn test_to_canonical_with_custom_layout() {
        let mapper = JsonMapper::new(EntityType::TestCase, jira_layout());
        let native = json!({
            "key": "QA-12",
            "fields": {
                "summary": "Checkout works",
                "status": {"name": "Approved"},
                "steps": [
                    {"index": 2, "step": "pay", "result": "receipt shown"},
                    {"index": 1, "step": "add to cart"}
                ],
                "custom": {"component": "cart", "risk": 3}
            }
        });

        let entity = mapper.to_canonical(&native).unwrap();
        assert_eq!(entity.source_id, "QA-12");
        assert_eq!(entity.name, "Checkout works");
        assert_eq!(entity.status.as_deref(), Some("Approved"));
        assert_eq!(entity.priority, None);
        assert_eq!(entity.steps.len(), 2);
        assert_eq!(entity.steps[0].sequence, 2);
        assert_eq!(entity.steps[0].expected_result.as_deref(), Some("receipt shown"));
        let keys: Vec<_> = entity.custom_fields.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["component", "risk"]);
    }

    #[test]
    fn test_out_of_range_step_sequence_uses_position() {
        let mapper = JsonMapper::new(EntityType::TestCase, JsonLayout::default());
        let native = json!({
            "id": "TC-1",
            "name": "Login",
            "steps": [
                {"sequence": 7, "action": "open"},
                {"sequence": 4_294_967_297u64, "action": "submit"}
            ]
        });
        let sequences: Vec<u32> = mapper
            .to_canonical(&native)
            .unwrap()
            .steps
            .iter()
            .map(|s| s.sequence)
            .collect();
        assert_eq!(sequences, vec![7, 2]);
    }

    #[test]
    fn test_source_ref_takes_precedence_over_own_id() {
        let mapper = JsonMapper::new(EntityType::TestCase, JsonLayout::default());
        let native = json!({"id": "qtest-9", "source_id": "TC-1", "name": "x"});
        assert_eq!(mapper.to_canonical(&native).unwrap().source_id, "TC-1");
        assert_eq!(mapper.native_id(&native).as_deref(), Some("qtest-9"));
    }

    #[test]
    fn test_malformed_payloads_are_rejected() {
        let mapper = JsonMapper::new(EntityType::TestCase, JsonLayout::default());
        assert!(mapper.to_canonical(&json!("just a string")).is_err());
        assert!(mapper.to_canonical(&json!({"id": 1})).is_err());
        assert!(mapper
            .to_canonical(&json!({"id": 1, "name": "x", "steps": "not a list"}))
            .is_err());
        assert!(mapper
            .to_canonical(&json!({"id": 1, "name": "x", "created_at": "yesterday"}))
            .is_err());
    }

    #[test]
    fn test_from_canonical_writes_layout_fields() {
        let mapper = JsonMapper::new(EntityType::TestCase, jira_layout());
        let mut entity = CanonicalEntity::new(EntityType::TestCase, "TC-1", "Login");
        entity.status = Some("Open".into());
        entity.steps = vec![TestStep {
            sequence: 1,
            action: "open".into(),
            expected_result: None,
            data: None,
        }];

        let native = mapper.from_canonical(&entity, &ProjectConfig::default()).unwrap();
        assert_eq!(
            native,
            json!({
                "fields": {
                    "migratedFrom": "TC-1",
                    "summary": "Login",
                    "status": {"name": "Open"},
                    "steps": [{"index": 1, "step": "open"}]
                }
            })
        );
    }
}

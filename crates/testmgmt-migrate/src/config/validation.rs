//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};
use std::collections::BTreeMap;

/// Validate the configuration. Every rejection is a validation error.
pub fn validate(config: &Config) -> Result<()> {
    for (label, endpoint) in [("source", &config.source), ("target", &config.target)] {
        if endpoint.provider.trim().is_empty() {
            return Err(MigrateError::validation(format!("{}.provider is required", label)));
        }
        if endpoint.project_id.trim().is_empty() {
            return Err(MigrateError::validation(format!("{}.project_id is required", label)));
        }
    }

    // Cannot migrate a project onto itself
    if config.source == config.target {
        return Err(MigrateError::validation(
            "source and target cannot be the same provider project",
        ));
    }

    let project = &config.project;
    if !project.source_project_id.is_empty() && project.source_project_id != config.source.project_id {
        return Err(MigrateError::validation(format!(
            "project.source_project_id '{}' does not match source.project_id '{}'",
            project.source_project_id, config.source.project_id
        )));
    }
    if !project.target_project_id.is_empty() && project.target_project_id != config.target.project_id {
        return Err(MigrateError::validation(format!(
            "project.target_project_id '{}' does not match target.project_id '{}'",
            project.target_project_id, config.target.project_id
        )));
    }
    check_mapping("project.field_mappings", &project.field_mappings)?;
    check_mapping("project.status_mappings", &project.status_mappings)?;
    check_mapping("project.priority_mappings", &project.priority_mappings)?;

    // Migration config validation - only check if explicitly set
    if let Some(0) = config.migration.workers {
        return Err(MigrateError::validation("migration.workers must be at least 1"));
    }
    if let Some(0) = config.migration.max_consecutive_failures {
        return Err(MigrateError::validation(
            "migration.max_consecutive_failures must be at least 1",
        ));
    }
    if let Some(0) = config.migration.call_timeout_ms {
        return Err(MigrateError::validation(
            "migration.call_timeout_ms must be positive when set",
        ));
    }
    if config.migration.get_retry_max_delay_ms() < config.migration.get_retry_base_delay_ms() {
        return Err(MigrateError::validation(
            "migration.retry_max_delay_ms is below retry_base_delay_ms",
        ));
    }
    if let Some(types) = &config.migration.entity_types {
        if types.is_empty() {
            return Err(MigrateError::validation("migration.entity_types cannot be empty"));
        }
    }

    for (provider, limits) in &config.rate_limits {
        limits.validate(&format!("rate_limits.{}", provider))?;
    }

    Ok(())
}

fn check_mapping(label: &str, map: &BTreeMap<String, String>) -> Result<()> {
    if let Some((key, _)) = map.iter().find(|(k, v)| k.trim().is_empty() || v.trim().is_empty()) {
        return Err(MigrateError::validation(format!(
            "{} contains an empty entry (key '{}')",
            label, key
        )));
    }
    Ok(())
}

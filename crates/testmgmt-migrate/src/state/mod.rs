//! Migration job state machine and persistence.
//!
//! A [`MigrationJob`] moves through
//! `pending -> running <-> paused -> {completed | failed | cancelled}`.
//! [`MigrationJob::transition`] enforces that graph; terminal states accept
//! no further transitions.
//!
//! Stores implement [`JobStore`]; see [`MemoryJobStore`] and [`FileJobStore`].

mod backend;
mod file;
mod memory;

pub use backend::{EntityOutcome, JobStore};
pub use file::FileJobStore;
pub use memory::MemoryJobStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{MigrateError, Result};
use crate::model::{entity_key, EntityType};

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Paused or terminal: no worker is making progress.
    pub fn is_settled(&self) -> bool {
        *self == JobStatus::Paused || self.is_terminal()
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why one entity could not be migrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFailure {
    pub entity_type: EntityType,
    pub source_id: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl EntityFailure {
    pub fn new(entity_type: EntityType, source_id: impl Into<String>, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            entity_type,
            source_id: source_id.into(),
            attempts,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }

    pub fn key(&self) -> String {
        entity_key(self.entity_type, &self.source_id)
    }
}

/// Entity counters. `processed` counts every settled entity, failed ones included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<EntityFailure>,
}

impl JobProgress {
    pub fn succeeded(&self) -> u64 {
        self.processed.saturating_sub(self.failed)
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.processed)
    }
}

/// What a resumed run needs to skip finished work and remap ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCheckpoint {
    /// Keys (`entity_type:source_id`) of entities that are done, failed or not.
    #[serde(default)]
    pub settled: BTreeSet<String>,

    /// Entity key -> id assigned by the target.
    #[serde(default)]
    pub id_map: BTreeMap<String, String>,
}

impl JobCheckpoint {
    pub fn is_settled(&self, key: &str) -> bool {
        self.settled.contains(key)
    }

    pub fn target_id(&self, entity_type: EntityType, source_id: &str) -> Option<&str> {
        self.id_map.get(&entity_key(entity_type, source_id)).map(String::as_str)
    }
}

/// A migration job. Mutated only by the orchestrator, through a [`JobStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: String,
    pub project_id: String,
    pub source_provider: String,
    pub target_provider: String,

    /// SHA256 of the job configuration; also the file store's HMAC key.
    pub config_hash: String,

    pub status: JobStatus,
    pub progress: JobProgress,

    #[serde(default)]
    pub checkpoint: JobCheckpoint,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    /// Systemic error that failed the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// HMAC-SHA256 signature written by [`FileJobStore`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl MigrationJob {
    /// Create a pending job.
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        source_provider: impl Into<String>,
        target_provider: impl Into<String>,
        config_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: project_id.into(),
            source_provider: source_provider.into(),
            target_provider: target_provider.into(),
            config_hash: config_hash.into(),
            status: JobStatus::Pending,
            progress: JobProgress::default(),
            checkpoint: JobCheckpoint::default(),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            error: None,
            hmac: None,
        }
    }

    /// Move to `next`, rejecting edges outside the lifecycle graph.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MigrateError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Apply one entity outcome. Already-settled entities are ignored, so a
    /// redelivered outcome never double-counts.
    pub fn apply_outcome(&mut self, outcome: &EntityOutcome) -> bool {
        let key = outcome.key();
        if self.checkpoint.is_settled(&key) {
            return false;
        }

        match outcome {
            EntityOutcome::Succeeded { target_id, .. } => {
                self.checkpoint.id_map.insert(key.clone(), target_id.clone());
            }
            EntityOutcome::Failed(failure) => {
                self.progress.failed += 1;
                self.progress.failures.push(failure.clone());
            }
        }
        self.checkpoint.settled.insert(key);
        self.progress.processed += 1;
        self.updated_at = Utc::now();
        true
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }
}

//! Job store contract.
//!
//! The orchestrator works with `Arc<dyn JobStore>` without knowing whether
//! jobs live in memory, on disk, or in an external database.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{EntityFailure, JobStatus, MigrationJob};
use crate::error::Result;
use crate::model::{entity_key, EntityType};

/// Final result for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum EntityOutcome {
    Succeeded {
        entity_type: EntityType,
        source_id: String,
        target_id: String,
    },
    Failed(EntityFailure),
}

impl EntityOutcome {
    pub fn key(&self) -> String {
        match self {
            EntityOutcome::Succeeded {
                entity_type,
                source_id,
                ..
            } => entity_key(*entity_type, source_id),
            EntityOutcome::Failed(failure) => failure.key(),
        }
    }
}

/// Read-modify-write callback applied under the store's lock.
pub type JobUpdate = Box<dyn FnOnce(&mut MigrationJob) -> Result<()> + Send>;

/// Durable storage of migration jobs.
///
/// Implementations must be `Send + Sync` and make [`update`](Self::update)
/// atomic: concurrent updates of one job never lose writes.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or overwrite a job.
    async fn save(&self, job: &MigrationJob) -> Result<()>;

    /// Load a job by id, `None` if it does not exist.
    async fn load(&self, id: &str) -> Result<Option<MigrationJob>>;

    /// All stored jobs, oldest first.
    async fn list(&self) -> Result<Vec<MigrationJob>>;

    /// Atomically apply `update` to the stored job and return the result.
    ///
    /// If `update` fails the stored job is left unchanged. Fails with
    /// `JobNotFound` for unknown ids.
    async fn update(&self, id: &str, update: JobUpdate) -> Result<MigrationJob>;

    /// Atomically record one entity outcome (progress increment).
    async fn record_outcome(&self, id: &str, outcome: EntityOutcome) -> Result<MigrationJob> {
        self.update(
            id,
            Box::new(move |job| {
                job.apply_outcome(&outcome);
                Ok(())
            }),
        )
        .await
    }

    /// Atomically move a job to `status`, recording `error` if given.
    async fn transition(&self, id: &str, status: JobStatus, error: Option<String>) -> Result<MigrationJob> {
        self.update(
            id,
            Box::new(move |job| {
                job.transition(status)?;
                if error.is_some() {
                    job.error = error;
                }
                Ok(())
            }),
        )
        .await
    }

    /// Set the number of entities the job will process.
    async fn set_total(&self, id: &str, total: u64) -> Result<MigrationJob> {
        self.update(
            id,
            Box::new(move |job| {
                job.progress.total = total;
                Ok(())
            }),
        )
        .await
    }
}

//! In-process job store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::backend::{JobStore, JobUpdate};
use super::MigrationJob;
use crate::error::{MigrateError, Result};

/// Job store backed by a mutex-guarded map. Jobs do not survive the process.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, MigrationJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &MigrationJob) -> Result<()> {
        self.jobs.lock().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<MigrationJob>> {
        Ok(self.jobs.lock().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<MigrationJob>> {
        let mut jobs: Vec<_> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<MigrationJob> {
        let mut jobs = self.jobs.lock();
        let stored = jobs
            .get_mut(id)
            .ok_or_else(|| MigrateError::JobNotFound(id.to_string()))?;

        let mut next = stored.clone();
        update(&mut next)?;
        *stored = next.clone();
        Ok(next)
    }
}

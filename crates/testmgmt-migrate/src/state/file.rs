//! File-based job store: one signed JSON document per job.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::backend::{JobStore, JobUpdate};
use super::MigrationJob;
use crate::error::{MigrateError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Stores each job as `<dir>/<job id>.json`.
///
/// Every file carries an HMAC-SHA256 signature keyed by the job's config
/// hash; a file whose signature does not match is rejected on load. Writes go
/// to a temp file that is then renamed over the original.
pub struct FileJobStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileJobStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(MigrateError::validation(format!("invalid job id '{}'", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    fn read(&self, path: &Path) -> Result<Option<MigrationJob>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let job: MigrationJob = serde_json::from_str(&content)?;

        let stored = job
            .hmac
            .as_deref()
            .ok_or_else(|| MigrateError::State(format!("{}: missing integrity signature", path.display())))?;
        if stored != compute_hmac(&job)? {
            return Err(MigrateError::State(format!(
                "{}: integrity check failed: HMAC mismatch (possible tampering)",
                path.display()
            )));
        }
        Ok(Some(job))
    }

    fn write(&self, job: &MigrationJob) -> Result<()> {
        let path = self.path_for(&job.id)?;
        let mut signed = job.clone();
        signed.hmac = Some(compute_hmac(&signed)?);

        let content = serde_json::to_string_pretty(&signed)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, &path)?;
        debug!("Saved job {} to {}", job.id, path.display());
        Ok(())
    }
}

/// Signature over the serialized job (excluding the signature itself),
/// keyed by its config hash.
fn compute_hmac(job: &MigrationJob) -> Result<String> {
    let mut unsigned = job.clone();
    unsigned.hmac = None;
    let content = serde_json::to_string(&unsigned)?;

    let mut mac = HmacSha256::new_from_slice(job.config_hash.as_bytes())
        .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
    mac.update(content.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save(&self, job: &MigrationJob) -> Result<()> {
        let _guard = self.lock.lock();
        self.write(job)
    }

    async fn load(&self, id: &str) -> Result<Option<MigrationJob>> {
        let path = self.path_for(id)?;
        let _guard = self.lock.lock();
        self.read(&path)
    }

    async fn list(&self) -> Result<Vec<MigrationJob>> {
        let _guard = self.lock.lock();
        let mut jobs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(job) = self.read(&path)? {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<MigrationJob> {
        let path = self.path_for(id)?;
        let _guard = self.lock.lock();
        let mut job = self
            .read(&path)?
            .ok_or_else(|| MigrateError::JobNotFound(id.to_string()))?;
        update(&mut job)?;
        self.write(&job)?;
        Ok(job)
    }
}

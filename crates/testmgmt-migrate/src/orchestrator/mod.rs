//! Migration orchestrator - job lifecycle coordinator.
//!
//! [`Orchestrator::start`] validates a job, persists it as `pending` and hands
//! it to a background runner. `pause`, `resume` and `cancel` signal that
//! runner cooperatively; the runner settles the job at the next entity
//! boundary.

mod control;
mod retry;
mod runner;

pub use control::{Interrupt, JobControl};
pub use retry::RetryPolicy;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{MigrateError, ProviderError, Result};
use crate::model::{EntityType, NativeEntity, ProjectConfig};
use crate::plan::{
    GraphSnapshot, MigrationPlan, OperationCatalog, OperationInstance, OperationType, ValidationReport,
};
use crate::provider::{AttachmentWorker, ProviderAdapter, ProviderCatalog, ProviderRole};
use crate::ratelimit::RateLimiter;
use crate::state::{JobStatus, JobStore, MigrationJob};
use crate::transform::{TransformPreview, TransformationEngine};
use control::JobHandle;
use runner::{JobRunner, RunContext, RunSettings};

/// Providers and plan resolved for one run.
struct Prepared {
    source: Arc<dyn ProviderAdapter>,
    target: Arc<dyn ProviderAdapter>,
    plan: MigrationPlan,
}

/// Migration orchestrator.
pub struct Orchestrator {
    providers: ProviderCatalog,
    engine: Arc<TransformationEngine>,
    limiter: Arc<RateLimiter>,
    store: Arc<dyn JobStore>,
    attachments: Option<Arc<dyn AttachmentWorker>>,
    jobs: DashMap<String, Arc<JobHandle>>,
}

impl Orchestrator {
    /// Create an orchestrator over the given providers, mappers and job store.
    pub fn new(providers: ProviderCatalog, engine: TransformationEngine, store: Arc<dyn JobStore>) -> Self {
        Self {
            providers,
            engine: Arc::new(engine),
            limiter: Arc::new(RateLimiter::default()),
            store,
            attachments: None,
            jobs: DashMap::new(),
        }
    }

    /// Share a rate limiter with other orchestrators talking to the same providers.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Enable attachment copying.
    pub fn with_attachment_worker(mut self, worker: Arc<dyn AttachmentWorker>) -> Self {
        self.attachments = Some(worker);
        self
    }

    pub fn engine(&self) -> &TransformationEngine {
        &self.engine
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Validate and persist a new job, then start migrating in the background.
    ///
    /// Returns the job id once the job is stored as `pending`.
    pub async fn start(&self, config: Config) -> Result<String> {
        config.validate()?;
        let prepared = self.prepare(&config).await?;

        let job_id = Uuid::new_v4().to_string();
        let job = MigrationJob::new(
            &job_id,
            &config.source.project_id,
            &config.source.provider,
            &config.target.provider,
            config.hash(),
        );
        self.store.save(&job).await?;
        info!(
            job_id = %job_id,
            "Created migration job {} -> {} for {:?}",
            config.source.provider,
            config.target.provider,
            prepared.plan.entity_order
        );

        let handle = Arc::new(JobHandle::new(config, JobStatus::Pending));
        self.jobs.insert(job_id.clone(), handle.clone());

        let mut active = handle.active.lock().await;
        let control = JobControl::new();
        *active = Some(control.clone());
        self.spawn_run(&job_id, &handle, prepared, control);
        drop(active);

        Ok(job_id)
    }

    /// Ask a running job to pause after its in-flight entities.
    ///
    /// Pausing an already paused job is a no-op.
    pub async fn pause(&self, job_id: &str) -> Result<()> {
        if let Some(handle) = self.handle(job_id) {
            let active = handle.active.lock().await;
            if let Some(control) = active.as_ref() {
                info!(job_id, "Pause requested");
                control.pause();
                return Ok(());
            }
        }

        let job = self.get_status(job_id).await?;
        match job.status {
            JobStatus::Paused => Ok(()),
            status => Err(MigrateError::InvalidTransition {
                from: status.to_string(),
                to: JobStatus::Paused.to_string(),
            }),
        }
    }

    /// Resume a paused job started by this orchestrator.
    pub async fn resume(&self, job_id: &str) -> Result<()> {
        match self.handle(job_id) {
            Some(handle) => self.resume_handle(job_id, handle).await,
            None => {
                self.get_status(job_id).await?;
                Err(MigrateError::State(format!(
                    "job {} has no configuration in this process, resume it with resume_with_config",
                    job_id
                )))
            }
        }
    }

    /// Resume a paused job from its persisted checkpoint.
    ///
    /// The configuration must hash to the value the job was started with.
    pub async fn resume_with_config(&self, job_id: &str, config: Config) -> Result<()> {
        config.validate()?;
        let job = self.get_status(job_id).await?;
        job.validate_config(&config.hash())?;

        let handle = self
            .jobs
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(JobHandle::new(config, job.status)))
            .clone();
        self.resume_handle(job_id, handle).await
    }

    async fn resume_handle(&self, job_id: &str, handle: Arc<JobHandle>) -> Result<()> {
        let mut active = handle.active.lock().await;
        if active.is_some() {
            // Still draining a previous run, pause has not settled yet.
            return Err(MigrateError::InvalidTransition {
                from: JobStatus::Running.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }

        let job = self.get_status(job_id).await?;
        if job.status != JobStatus::Paused {
            return Err(MigrateError::InvalidTransition {
                from: job.status.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }

        let prepared = self.prepare(&handle.config).await?;
        self.store.transition(job_id, JobStatus::Running, None).await?;
        handle.publish(JobStatus::Running);
        info!(
            job_id,
            "Resuming with {} of {} entities processed", job.progress.processed, job.progress.total
        );

        let control = JobControl::new();
        *active = Some(control.clone());
        self.spawn_run(job_id, &handle, prepared, control);
        Ok(())
    }

    /// Cancel a job. A running job stops after its in-flight entities; a paused
    /// job is cancelled immediately.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let handle = self.handle(job_id);
        if let Some(handle) = &handle {
            let active = handle.active.lock().await;
            if let Some(control) = active.as_ref() {
                info!(job_id, "Cancel requested");
                control.cancel();
                return Ok(());
            }
            // Hold the lock so no resume can slip in before the transition.
            let job = self.store.transition(job_id, JobStatus::Cancelled, None).await?;
            handle.publish(job.status);
            info!(job_id, "Cancelled");
            return Ok(());
        }

        self.store.transition(job_id, JobStatus::Cancelled, None).await?;
        info!(job_id, "Cancelled");
        Ok(())
    }

    /// Read-only snapshot of a job.
    pub async fn get_status(&self, job_id: &str) -> Result<MigrationJob> {
        self.store
            .load(job_id)
            .await?
            .ok_or_else(|| MigrateError::JobNotFound(job_id.to_string()))
    }

    pub async fn list_jobs(&self) -> Result<Vec<MigrationJob>> {
        self.store.list().await
    }

    /// Watch a job's status.
    pub async fn subscribe(&self, job_id: &str) -> Result<watch::Receiver<JobStatus>> {
        if let Some(handle) = self.handle(job_id) {
            return Ok(handle.status.subscribe());
        }
        // Not driven by this process: the status cannot change under us.
        let job = self.get_status(job_id).await?;
        let (_tx, rx) = watch::channel(job.status);
        Ok(rx)
    }

    /// Wait until the job is paused or terminal.
    pub async fn wait_settled(&self, job_id: &str) -> Result<JobStatus> {
        let mut rx = self.subscribe(job_id).await?;
        let status = *rx
            .wait_for(JobStatus::is_settled)
            .await
            .map_err(|_| MigrateError::State(format!("status channel of job {} closed", job_id)))?;
        Ok(status)
    }

    /// Dependency graph of a registered provider acting in `role`.
    pub fn dependency_graph(&self, provider: &str, role: ProviderRole) -> Result<GraphSnapshot> {
        let adapter = self.providers.require(provider)?;
        Ok(OperationCatalog::graph(&adapter.capabilities(), role)?.snapshot())
    }

    pub fn validate_operations(
        &self,
        provider: &str,
        role: ProviderRole,
        ops: &[OperationInstance],
    ) -> Result<ValidationReport> {
        let adapter = self.providers.require(provider)?;
        Ok(OperationCatalog::graph(&adapter.capabilities(), role)?.validate_operations(ops))
    }

    pub fn minimal_operation_set(
        &self,
        provider: &str,
        role: ProviderRole,
        goal: OperationType,
    ) -> Result<Vec<OperationType>> {
        let adapter = self.providers.require(provider)?;
        OperationCatalog::graph(&adapter.capabilities(), role)?.minimal_operation_set(goal)
    }

    /// Source, canonical and target forms of one entity. Touches no job state.
    pub fn preview_transformation(
        &self,
        input: &NativeEntity,
        entity_type: EntityType,
        source_system: &str,
        target_system: &str,
        project: &ProjectConfig,
    ) -> Result<TransformPreview> {
        self.engine
            .preview(input, entity_type, source_system, target_system, project)
    }

    fn handle(&self, job_id: &str) -> Option<Arc<JobHandle>> {
        self.jobs.get(job_id).map(|h| h.value().clone())
    }

    /// Resolve providers and plan, and check both connections.
    async fn prepare(&self, config: &Config) -> Result<Prepared> {
        let source = self.providers.require(&config.source.provider)?;
        let target = self.providers.require(&config.target.provider)?;

        let plan = MigrationPlan::build(
            &source.capabilities(),
            &target.capabilities(),
            &config.migration.get_entity_types(),
        )?;
        for entity_type in &plan.entity_order {
            self.engine
                .ensure_mappers(source.name(), target.name(), *entity_type)?;
        }

        for (provider, limits) in &config.rate_limits {
            self.limiter.configure(provider.clone(), limits.clone());
        }

        check_connection(&self.limiter, source.as_ref()).await?;
        check_connection(&self.limiter, target.as_ref()).await?;

        Ok(Prepared { source, target, plan })
    }

    fn spawn_run(&self, job_id: &str, handle: &Arc<JobHandle>, prepared: Prepared, control: JobControl) {
        let migration = &handle.config.migration;
        let ctx = RunContext {
            job_id: job_id.to_string(),
            source: prepared.source,
            target: prepared.target,
            engine: self.engine.clone(),
            limiter: self.limiter.clone(),
            store: self.store.clone(),
            attachments: self.attachments.clone(),
            plan: prepared.plan,
            project: handle.config.project_config(),
            settings: RunSettings {
                workers: migration.get_workers(),
                retry: RetryPolicy::from_config(migration),
                max_consecutive_failures: migration.get_max_consecutive_failures(),
                call_timeout: migration.call_timeout_ms.map(Duration::from_millis),
            },
            control,
            handle: handle.clone(),
        };
        tokio::spawn(JobRunner::new(ctx).run());
    }
}

async fn check_connection(limiter: &RateLimiter, adapter: &dyn ProviderAdapter) -> Result<()> {
    limiter.throttle(adapter.name()).await;
    let status = adapter.test_connection().await;
    if status.connected {
        return Ok(());
    }

    let message = status
        .message
        .unwrap_or_else(|| "connection test failed".to_string());
    let err = if status.retryable {
        ProviderError::transient(adapter.name(), message)
    } else {
        ProviderError::authentication(adapter.name(), message)
    };
    Err(err.into())
}

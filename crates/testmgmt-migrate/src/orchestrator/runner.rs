//! Per-job execution loop.
//!
//! A run lists every planned entity type from the source, then migrates the
//! entities type by type in plan order. Within a type up to `workers`
//! entities are in flight; each one is fetched, canonicalized, shaped to the
//! target's capabilities, remapped, rendered and pushed. A type whose parent
//! is its own kind (folders) runs in depth layers, parents first, so a child
//! always sees its parent's target id. Pause and cancel are observed only
//! before an entity is dispatched.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::control::{Interrupt, JobControl, JobHandle};
use super::retry::RetryPolicy;
use crate::error::{MigrateError, ProviderError, ProviderErrorKind, Result};
use crate::model::{entity_key, CanonicalEntity, EntityType, NativeEntity, ProjectConfig};
use crate::plan::MigrationPlan;
use crate::provider::{AttachmentWorker, FetchParams, ProviderAdapter, ProviderCapabilities};
use crate::ratelimit::RateLimiter;
use crate::state::{EntityFailure, EntityOutcome, JobStatus, JobStore};
use crate::transform::TransformationEngine;

/// Execution settings of one run.
#[derive(Debug, Clone)]
pub(crate) struct RunSettings {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub max_consecutive_failures: u32,
    pub call_timeout: Option<Duration>,
}

/// Everything a run needs, shared by its workers.
pub(crate) struct RunContext {
    pub job_id: String,
    pub source: Arc<dyn ProviderAdapter>,
    pub target: Arc<dyn ProviderAdapter>,
    pub engine: Arc<TransformationEngine>,
    pub limiter: Arc<RateLimiter>,
    pub store: Arc<dyn JobStore>,
    pub attachments: Option<Arc<dyn AttachmentWorker>>,
    pub plan: MigrationPlan,
    pub project: ProjectConfig,
    pub settings: RunSettings,
    pub control: JobControl,
    pub handle: Arc<JobHandle>,
}

/// One entity waiting to be migrated.
#[derive(Debug, Clone)]
struct WorkItem {
    entity_type: EntityType,
    source_id: String,
    parent_id: Option<String>,
    listed: NativeEntity,
}

impl WorkItem {
    fn key(&self) -> String {
        entity_key(self.entity_type, &self.source_id)
    }
}

/// A call that exhausted its retries, or failed without being retryable.
#[derive(Debug)]
struct CallFailure {
    error: MigrateError,
    attempts: u32,
}

impl CallFailure {
    fn once(error: MigrateError) -> Self {
        Self { error, attempts: 1 }
    }
}

/// Split a batch into dispatch layers.
///
/// Only a self-parented type gets more than one layer: an entity sits one
/// layer below its parent when that parent is in the same batch. Cycles and
/// parents outside the batch end the walk.
fn dispatch_layers(entity_type: EntityType, items: Vec<WorkItem>) -> Vec<Vec<WorkItem>> {
    if entity_type.parent_type() != Some(entity_type) {
        return vec![items];
    }

    let parents: BTreeMap<String, Option<String>> = items
        .iter()
        .map(|item| (item.source_id.clone(), item.parent_id.clone()))
        .collect();
    let depth_of = |source_id: &str| {
        let mut seen = BTreeSet::from([source_id.to_string()]);
        let mut current = parents.get(source_id).cloned().flatten();
        let mut depth = 0;
        while let Some(parent) = current {
            if !parents.contains_key(&parent) || !seen.insert(parent.clone()) {
                break;
            }
            depth += 1;
            current = parents.get(&parent).cloned().flatten();
        }
        depth
    };

    let mut layers: Vec<Vec<WorkItem>> = Vec::new();
    for item in items {
        let depth = depth_of(&item.source_id);
        if layers.len() <= depth {
            layers.resize_with(depth + 1, Vec::new);
        }
        layers[depth].push(item);
    }
    layers.retain(|layer| !layer.is_empty());
    layers
}

pub(crate) struct JobRunner {
    ctx: RunContext,
    target_caps: ProviderCapabilities,
    id_map: Mutex<BTreeMap<String, String>>,
    consecutive_failures: AtomicU32,
    halt_reason: Mutex<Option<String>>,
}

impl JobRunner {
    pub(crate) fn new(ctx: RunContext) -> Self {
        let target_caps = ctx.target.capabilities();
        Self {
            ctx,
            target_caps,
            id_map: Mutex::new(BTreeMap::new()),
            consecutive_failures: AtomicU32::new(0),
            halt_reason: Mutex::new(None),
        }
    }

    /// Drive the job until it is paused, cancelled, failed or completed.
    pub(crate) async fn run(self) {
        let runner = Arc::new(self);
        let result = runner.clone().execute().await;
        runner.finish(result).await;
    }

    async fn execute(self: Arc<Self>) -> Result<Option<Interrupt>> {
        let ctx = &self.ctx;
        let mut job = ctx
            .store
            .load(&ctx.job_id)
            .await?
            .ok_or_else(|| MigrateError::JobNotFound(ctx.job_id.clone()))?;

        if job.status == JobStatus::Pending {
            job = ctx.store.transition(&ctx.job_id, JobStatus::Running, None).await?;
            ctx.handle.publish(JobStatus::Running);
        }
        info!(
            job_id = %ctx.job_id,
            "Running migration {} -> {} ({} already processed)",
            ctx.source.name(),
            ctx.target.name(),
            job.progress.processed
        );

        *self.id_map.lock() = job.checkpoint.id_map.clone();
        let settled: BTreeSet<String> = job.checkpoint.settled.clone();

        let batches = self.discover().await?;
        let total: usize = batches.iter().map(|(_, items)| items.len()).sum();
        ctx.store.set_total(&ctx.job_id, total as u64).await?;

        let semaphore = Arc::new(Semaphore::new(ctx.settings.workers.max(1)));
        let mut stop = None;

        'types: for (entity_type, items) in batches {
            if let Some(interrupt) = ctx.control.interrupt() {
                stop = Some(interrupt);
                break;
            }
            debug!(job_id = %ctx.job_id, entity_type = %entity_type, "Migrating {} entities", items.len());

            for layer in dispatch_layers(entity_type, items) {
                stop = self.dispatch(layer, &settled, &semaphore).await;
                if stop.is_some() {
                    break 'types;
                }
            }
        }

        // A halt raised while draining outranks the interrupt that stopped dispatch.
        if ctx.control.is_halted() {
            return Ok(Some(Interrupt::Halt));
        }
        Ok(stop)
    }

    /// Run one layer of entities and wait for all of them to settle.
    async fn dispatch(
        self: &Arc<Self>,
        items: Vec<WorkItem>,
        settled: &BTreeSet<String>,
        semaphore: &Arc<Semaphore>,
    ) -> Option<Interrupt> {
        let ctx = &self.ctx;
        let mut stop = None;
        let mut tasks = JoinSet::new();

        for item in items {
            if settled.contains(&item.key()) {
                continue;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            // Boundary check after the previous entity has released its slot.
            if let Some(interrupt) = ctx.control.interrupt() {
                stop = Some(interrupt);
                break;
            }

            let runner = self.clone();
            tasks.spawn(async move {
                runner.process(item).await;
                drop(permit);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(job_id = %ctx.job_id, "Entity worker panicked: {}", e);
            }
        }
        stop
    }

    /// List every planned entity type from the source.
    async fn discover(&self) -> Result<Vec<(EntityType, Vec<WorkItem>)>> {
        let ctx = &self.ctx;
        let source = ctx.source.as_ref();
        let params = FetchParams::project(ctx.project.source_project_id.clone());
        let mut batches = Vec::with_capacity(ctx.plan.entity_order.len());

        for &entity_type in &ctx.plan.entity_order {
            let mapper = ctx.engine.registry().require(source.name(), entity_type)?;
            let params = &params;
            let records = self
                .call(source, || source.fetch(entity_type, params))
                .await
                .map_err(|f| {
                    MigrateError::State(format!(
                        "listing {} from {} failed after {} attempts: {}",
                        entity_type,
                        source.name(),
                        f.attempts,
                        f.error
                    ))
                })?;

            let items = records
                .into_iter()
                .enumerate()
                .map(|(index, listed)| {
                    let canonical = mapper.to_canonical(&listed).ok();
                    let source_id = mapper
                        .native_id(&listed)
                        .or_else(|| canonical.as_ref().map(|c| c.source_id.clone()))
                        .unwrap_or_else(|| format!("#{}", index));
                    WorkItem {
                        entity_type,
                        source_id,
                        parent_id: canonical.and_then(|c| c.parent_id),
                        listed,
                    }
                })
                .collect::<Vec<_>>();
            info!(
                job_id = %ctx.job_id,
                entity_type = %entity_type,
                "Discovered {} entities", items.len()
            );
            batches.push((entity_type, items));
        }

        Ok(batches)
    }

    async fn process(&self, item: WorkItem) {
        let ctx = &self.ctx;
        let outcome = match self.migrate_entity(&item).await {
            Ok(target_id) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.id_map.lock().insert(item.key(), target_id.clone());
                debug!(
                    job_id = %ctx.job_id,
                    entity_type = %item.entity_type,
                    source_id = %item.source_id,
                    "Migrated as {}", target_id
                );
                EntityOutcome::Succeeded {
                    entity_type: item.entity_type,
                    source_id: item.source_id.clone(),
                    target_id,
                }
            }
            Err(failure) if failure.error.is_systemic() => {
                self.halt(format!(
                    "{} {}: {}",
                    item.entity_type, item.source_id, failure.error
                ));
                return;
            }
            Err(failure) => {
                warn!(
                    job_id = %ctx.job_id,
                    entity_type = %item.entity_type,
                    source_id = %item.source_id,
                    attempt = failure.attempts,
                    "Entity failed: {}", failure.error
                );
                // Only unreachable providers build a streak; refused entities leave it alone.
                if failure.error.is_connectivity() {
                    let streak = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if streak >= ctx.settings.max_consecutive_failures {
                        self.halt(format!(
                            "{} consecutive entity failures, last: {}",
                            streak, failure.error
                        ));
                    }
                }
                EntityOutcome::Failed(EntityFailure::new(
                    item.entity_type,
                    item.source_id.clone(),
                    failure.attempts,
                    failure.error.to_string(),
                ))
            }
        };

        if let Err(e) = ctx.store.record_outcome(&ctx.job_id, outcome).await {
            self.halt(format!("failed to record progress: {}", e));
        }
    }

    /// Fetch, transform and push one entity. Returns the target id.
    async fn migrate_entity(&self, item: &WorkItem) -> std::result::Result<String, CallFailure> {
        let ctx = &self.ctx;
        let source = ctx.source.as_ref();
        let target = ctx.target.as_ref();
        let entity_type = item.entity_type;

        let params = FetchParams::entity(ctx.project.source_project_id.clone(), item.source_id.clone());
        let params = &params;
        let detail = self.call(source, || source.fetch(entity_type, params)).await?;
        let native = detail.into_iter().next().unwrap_or_else(|| item.listed.clone());

        let canonical = ctx
            .engine
            .canonicalize(&native, entity_type, source.name(), &ctx.project)
            .map_err(CallFailure::once)?;
        let mut entity = canonical.entity;
        let mut warnings = canonical.warnings;

        self.shape(&mut entity, &mut warnings);
        self.remap_ids(&mut entity, &mut warnings);
        if !entity.attachments.is_empty() {
            self.copy_attachments(&mut entity).await?;
        }

        let rendered = ctx
            .engine
            .render(target.name(), &entity, &ctx.project)
            .map_err(CallFailure::once)?;
        for warning in &warnings {
            debug!(
                job_id = %ctx.job_id,
                entity_type = %entity_type,
                source_id = %item.source_id,
                "{}", warning
            );
        }

        let rendered = &rendered;
        self.call(target, || target.push(entity_type, rendered)).await
    }

    /// Drop what the target cannot store.
    fn shape(&self, entity: &mut CanonicalEntity, warnings: &mut Vec<String>) {
        let caps = &self.target_caps;
        if !caps.supports_test_steps && !entity.steps.is_empty() {
            warnings.push(format!("target has no test steps, dropped {}", entity.steps.len()));
            entity.steps.clear();
        }
        if !caps.supports_custom_fields && !entity.custom_fields.is_empty() {
            warnings.push(format!(
                "target has no custom fields, dropped {}",
                entity.custom_fields.len()
            ));
            entity.custom_fields.clear();
        }
        let copy_attachments = self.ctx.plan.attachments && self.ctx.attachments.is_some();
        if !copy_attachments && !entity.attachments.is_empty() {
            warnings.push(format!("attachments not migrated, dropped {}", entity.attachments.len()));
            entity.attachments.clear();
        }
    }

    /// Point parent and linked ids at entities already created in the target.
    fn remap_ids(&self, entity: &mut CanonicalEntity, warnings: &mut Vec<String>) {
        let id_map = self.id_map.lock();

        if let Some(parent_type) = entity.entity_type.parent_type() {
            if let Some(parent) = entity.parent_id.take() {
                match id_map.get(&entity_key(parent_type, &parent)) {
                    Some(mapped) => entity.parent_id = Some(mapped.clone()),
                    None => {
                        warnings.push(format!("parent {} {} not migrated, detached", parent_type, parent));
                    }
                }
            }
        }

        if let Some(link_type) = entity.entity_type.link_type() {
            let links = std::mem::take(&mut entity.linked_ids);
            for link in links {
                match id_map.get(&entity_key(link_type, &link)) {
                    Some(mapped) => entity.linked_ids.push(mapped.clone()),
                    None => warnings.push(format!("linked {} {} not migrated, dropped", link_type, link)),
                }
            }
        }
    }

    async fn copy_attachments(&self, entity: &mut CanonicalEntity) -> std::result::Result<(), CallFailure> {
        let Some(worker) = self.ctx.attachments.as_ref() else {
            return Ok(());
        };
        let source = self.ctx.source.as_ref();

        for attachment in entity.attachments.iter_mut() {
            let current = &*attachment;
            let bytes = self.call(source, || source.fetch_attachment(current)).await?;
            attachment.storage_key = worker
                .migrate(&attachment.storage_key, bytes)
                .await
                .map_err(CallFailure::once)?;
        }
        Ok(())
    }

    /// Throttled, timed, retried adapter call.
    async fn call<T, F, Fut>(&self, adapter: &dyn ProviderAdapter, op: F) -> std::result::Result<T, CallFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let provider = adapter.name();
        let mut attempt = 1;
        loop {
            self.ctx.limiter.throttle(provider).await;

            let result = match self.ctx.settings.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(MigrateError::Provider(ProviderError::timeout(
                        provider,
                        format!("call exceeded {}ms", limit.as_millis()),
                    ))),
                },
                None => op().await,
            };

            match result {
                Ok(value) => {
                    self.ctx.limiter.record_success(provider);
                    return Ok(value);
                }
                Err(error) => {
                    self.observe_failure(provider, &error);
                    if !self.ctx.settings.retry.should_retry(&error, attempt) {
                        return Err(CallFailure { error, attempts: attempt });
                    }
                    let delay = self.ctx.settings.retry.delay_for(&error, attempt);
                    debug!(
                        job_id = %self.ctx.job_id,
                        provider,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after: {}", error
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Feed a failed call into the limiter.
    fn observe_failure(&self, provider: &str, error: &MigrateError) {
        let limiter = &self.ctx.limiter;
        match error {
            MigrateError::Provider(e) if e.kind == ProviderErrorKind::RateLimited => {
                let reset_ms = limiter.resolve_reset_ms(provider, e.retry_after.as_ref());
                limiter.handle_rate_limit_response(provider, reset_ms);
            }
            MigrateError::RateLimited { reset_ms, .. } => {
                limiter.handle_rate_limit_response(provider, *reset_ms);
            }
            MigrateError::Provider(e) if matches!(e.kind, ProviderErrorKind::Transient | ProviderErrorKind::Timeout) => {
                limiter.record_failure(provider);
            }
            _ => {}
        }
    }

    fn halt(&self, reason: String) {
        let mut slot = self.halt_reason.lock();
        if slot.is_none() {
            error!(job_id = %self.ctx.job_id, "Stopping job: {}", reason);
            *slot = Some(reason);
        }
        self.ctx.control.halt();
    }

    /// Persist the settled status and release the handle.
    async fn finish(&self, result: Result<Option<Interrupt>>) {
        let ctx = &self.ctx;
        let mut active = ctx.handle.active.lock().await;

        let (status, reason) = match result {
            Err(e) => (JobStatus::Failed, Some(e.to_string())),
            Ok(Some(Interrupt::Halt)) => (JobStatus::Failed, self.halt_reason.lock().clone()),
            Ok(Some(Interrupt::Cancel)) => (JobStatus::Cancelled, None),
            // A cancel that arrived while the paused run drained wins.
            Ok(Some(Interrupt::Pause)) if ctx.control.is_cancel_requested() => (JobStatus::Cancelled, None),
            Ok(Some(Interrupt::Pause)) => (JobStatus::Paused, None),
            Ok(None) => (JobStatus::Completed, None),
        };

        match ctx.store.transition(&ctx.job_id, status, reason.clone()).await {
            Ok(job) => {
                info!(
                    job_id = %ctx.job_id,
                    "Job {}: {} processed, {} failed of {}",
                    status,
                    job.progress.processed,
                    job.progress.failed,
                    job.progress.total
                );
                ctx.handle.publish(status);
            }
            Err(e) => {
                error!(job_id = %ctx.job_id, "Failed to record final status {}: {}", status, e);
                if let Ok(Some(job)) = ctx.store.load(&ctx.job_id).await {
                    ctx.handle.publish(job.status);
                }
            }
        }
        if let Some(reason) = reason {
            warn!(job_id = %ctx.job_id, "Job failed: {}", reason);
        }
        *active = None;
    }
}

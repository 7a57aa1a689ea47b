//! # testmgmt-migrate
//!
//! Migration orchestration core for moving test-management assets (test
//! cases, steps, cycles, executions, attachments) between SaaS providers.
//!
//! The library provides:
//!
//! - **Operation planning** with a dependency graph derived from provider capabilities
//! - **Canonical transformation** through pluggable per-provider mappers
//! - **Resumable jobs** with pause, resume and cancel at entity boundaries
//! - **Adaptive rate limiting** per provider, honouring 429 reset hints
//!
//! Concrete provider adapters live outside this crate and implement
//! [`ProviderAdapter`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use testmgmt_migrate::{
//!     Config, MapperRegistry, MemoryJobStore, Orchestrator, ProviderCatalog, TransformationEngine,
//! };
//!
//! # async fn run(providers: ProviderCatalog, mappers: MapperRegistry) -> testmgmt_migrate::Result<()> {
//! let config = Config::load("migration.yaml")?;
//! let orchestrator = Orchestrator::new(
//!     providers,
//!     TransformationEngine::new(mappers),
//!     Arc::new(MemoryJobStore::new()),
//! );
//! let job_id = orchestrator.start(config).await?;
//! let status = orchestrator.wait_settled(&job_id).await?;
//! println!("job {} finished as {}", job_id, status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod provider;
pub mod ratelimit;
pub mod state;
pub mod transform;

// Re-exports for convenient access
pub use config::{Config, EndpointConfig, MigrationConfig};
pub use error::{MigrateError, ProviderError, ProviderErrorKind, Result, RetryAfter};
pub use model::{CanonicalEntity, EntityType, NativeEntity, ProjectConfig};
pub use orchestrator::{JobControl, Orchestrator, RetryPolicy};
pub use plan::{DependencyGraph, MigrationPlan, OperationCatalog, OperationDefinition, OperationType};
pub use provider::{
    AttachmentWorker, ConnectionStatus, FetchParams, MemoryProvider, ProviderAdapter, ProviderCapabilities,
    ProviderCatalog, ProviderRole,
};
pub use ratelimit::{RateLimitConfig, RateLimitMetrics, RateLimiter, ResetMode};
pub use state::{FileJobStore, JobStatus, JobStore, MemoryJobStore, MigrationJob};
pub use transform::{EntityMapper, JsonLayout, JsonMapper, MapperRegistry, TransformationEngine};

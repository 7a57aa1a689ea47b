//! Provider adapter contract.
//!
//! Concrete adapters (Zephyr, qTest, TestRail, ...) live outside this crate and
//! implement [`ProviderAdapter`]. The orchestrator works with
//! `Arc<dyn ProviderAdapter>` and branches only on the declared
//! [`ProviderCapabilities`], never on the provider name.
//!
//! - [`ProviderCatalog`]: explicit registry of adapters by name
//! - [`AttachmentWorker`]: binary copy service for attachments
//! - [`memory`]: in-process adapter used by tests and dry runs

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{MigrateError, ProviderError, ProviderErrorKind, Result};
use crate::model::{AttachmentRef, EntityType, NativeEntity};

pub use memory::{MemoryAttachmentStore, MemoryProvider, PushGate};

/// Which side of a migration a provider is acting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    Source,
    Target,
}

/// What a provider declares it can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub can_be_source: bool,
    pub can_be_target: bool,
    pub entity_types: Vec<EntityType>,
    #[serde(default)]
    pub supports_attachments: bool,
    #[serde(default)]
    pub supports_execution_history: bool,
    #[serde(default)]
    pub supports_test_steps: bool,
    #[serde(default)]
    pub supports_custom_fields: bool,
}

impl ProviderCapabilities {
    pub fn handles(&self, entity_type: EntityType) -> bool {
        self.entity_types.contains(&entity_type)
    }
}

/// Result of a provider health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    /// Whether the failure is worth retrying (false for rejected credentials).
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ConnectionStatus {
    pub fn connected() -> Self {
        Self {
            connected: true,
            retryable: false,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            connected: false,
            retryable,
            message: Some(message.into()),
        }
    }
}

/// Query passed to [`ProviderAdapter::fetch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchParams {
    pub project_id: String,
    /// Restrict to a single entity (detail fetch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

impl FetchParams {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            entity_id: None,
        }
    }

    pub fn entity(project_id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            entity_id: Some(entity_id.into()),
        }
    }
}

/// Adapter over one provider's REST API.
///
/// Implementations must be `Send + Sync`; the orchestrator shares one adapter
/// across all workers of all jobs. Calls should be idempotent where the
/// provider allows it, since delivery is at-least-once.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name; also the rate-limiter key.
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    async fn test_connection(&self) -> ConnectionStatus;

    /// List entities of a type, or a single entity when `params.entity_id` is set.
    async fn fetch(&self, entity_type: EntityType, params: &FetchParams) -> Result<Vec<NativeEntity>>;

    /// Create an entity, returning the provider-assigned id.
    async fn push(&self, entity_type: EntityType, entity: &NativeEntity) -> Result<String>;

    /// Download an attachment's bytes.
    async fn fetch_attachment(&self, attachment: &AttachmentRef) -> Result<Vec<u8>> {
        Err(MigrateError::Provider(ProviderError::new(
            self.name(),
            ProviderErrorKind::Unsupported,
            format!("attachment download not supported ({})", attachment.file_name),
        )))
    }
}

/// Copies attachment binaries between storage locations.
#[async_trait]
pub trait AttachmentWorker: Send + Sync {
    /// Store `bytes` for the attachment at `storage_key`, returning the new key.
    async fn migrate(&self, storage_key: &str, bytes: Vec<u8>) -> Result<String>;
}

/// Registry of provider adapters by name.
///
/// Explicitly constructed and passed to the orchestrator.
#[derive(Default, Clone)]
pub struct ProviderCatalog {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Get an adapter by name, returning an error if not found.
    pub fn require(&self, name: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.get(name)
            .ok_or_else(|| MigrateError::Config(format!("Unknown provider: {}", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

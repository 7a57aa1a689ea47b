//! Error types for the migration library.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::EntityType;
use crate::plan::OperationType;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing sections, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input parameters rejected before any provider call.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The operation dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    CycleDetected { cycle: Vec<OperationType> },

    /// No mapper registered for a (system, entity type) pair.
    #[error("No mapper registered for {system}/{entity_type}")]
    MapperNotFound {
        system: String,
        entity_type: EntityType,
    },

    /// Operation referenced but not present in the graph.
    #[error("Unknown operation: {0}")]
    UnknownOperation(OperationType),

    /// Provider adapter or network failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Rate limit hit; absorbed by the rate limiter, never surfaced on a job.
    #[error("Rate limited by {provider}, retry in {reset_ms}ms")]
    RateLimited { provider: String, reset_ms: u64 },

    /// No job with the given id.
    #[error("Migration job not found: {0}")]
    JobNotFound(String),

    /// Job state machine rejected a transition.
    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Job store error
    #[error("Job store error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since the job was started - cannot resume")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled.
    #[error("Migration cancelled")]
    Cancelled,
}

fn format_cycle(cycle: &[OperationType]) -> String {
    cycle
        .iter()
        .map(|op| op.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl MigrateError {
    /// Create a Validation error
    pub fn validation(message: impl Into<String>) -> Self {
        MigrateError::Validation(message.into())
    }

    /// Create a MapperNotFound error
    pub fn mapper_not_found(system: impl Into<String>, entity_type: EntityType) -> Self {
        MigrateError::MapperNotFound {
            system: system.into(),
            entity_type,
        }
    }

    /// Whether a retry of the failed call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MigrateError::Provider(e) => e.is_retryable(),
            MigrateError::RateLimited { .. } => true,
            _ => false,
        }
    }

    /// Whether the error says the provider could not be reached, rather than
    /// that it refused this particular entity.
    pub fn is_connectivity(&self) -> bool {
        match self {
            MigrateError::Provider(e) => matches!(
                e.kind,
                ProviderErrorKind::Transient | ProviderErrorKind::Timeout | ProviderErrorKind::RateLimited
            ),
            MigrateError::RateLimited { .. } => true,
            _ => false,
        }
    }

    /// Whether the error means the whole job cannot continue.
    pub fn is_systemic(&self) -> bool {
        matches!(self, MigrateError::Provider(e) if e.is_systemic())
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Classification of a provider adapter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Network blip, 5xx, connection reset.
    Transient,
    /// The call exceeded its timeout.
    Timeout,
    /// 429 or provider-specific equivalent.
    RateLimited,
    /// Credentials permanently rejected.
    Authentication,
    /// Entity or project does not exist.
    NotFound,
    /// Payload rejected by the provider (4xx other than auth/429).
    Rejected,
    /// Operation not supported by this provider.
    Unsupported,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderErrorKind::Transient => "transient",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::Authentication => "authentication",
            ProviderErrorKind::NotFound => "not_found",
            ProviderErrorKind::Rejected => "rejected",
            ProviderErrorKind::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

/// Reset hint attached to a rate-limited response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAfter {
    /// Adapter already resolved the reset time.
    Millis(u64),
    /// Raw response headers; the rate limiter extracts the reset time.
    Headers(HashMap<String, String>),
}

/// Failure reported by a provider adapter.
#[derive(Error, Debug, Clone)]
#[error("Provider {provider} error ({kind}): {message}")]
pub struct ProviderError {
    pub provider: String,
    pub kind: ProviderErrorKind,
    pub message: String,
    pub retry_after: Option<RetryAfter>,
}

impl ProviderError {
    pub fn new(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Transient, message)
    }

    pub fn timeout(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Timeout, message)
    }

    pub fn authentication(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Authentication, message)
    }

    /// A 429-style response with an explicit reset hint.
    pub fn rate_limited(provider: impl Into<String>, retry_after: RetryAfter) -> Self {
        let mut err = Self::new(provider, ProviderErrorKind::RateLimited, "rate limit exceeded");
        err.retry_after = Some(retry_after);
        err
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Transient
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::RateLimited
        )
    }

    pub fn is_systemic(&self) -> bool {
        self.kind == ProviderErrorKind::Authentication
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

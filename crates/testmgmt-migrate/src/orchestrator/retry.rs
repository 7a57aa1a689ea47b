//! Retry policy for adapter calls.

use std::time::Duration;

use crate::config::MigrationConfig;
use crate::error::{MigrateError, ProviderErrorKind};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&MigrationConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            max_retries: config.get_max_retries(),
            base_delay: Duration::from_millis(config.get_retry_base_delay_ms()),
            max_delay: Duration::from_millis(config.get_retry_max_delay_ms()),
        }
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another.
    pub fn should_retry(&self, err: &MigrateError, attempt: u32) -> bool {
        err.is_retryable() && attempt <= self.max_retries
    }

    /// Delay before the retry that follows attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retrying after `err`.
    ///
    /// Rate-limited failures get none: the limiter's deadline already holds
    /// the next call back.
    pub fn delay_for(&self, err: &MigrateError, attempt: u32) -> Duration {
        match err {
            MigrateError::Provider(e) if e.kind == ProviderErrorKind::RateLimited => Duration::ZERO,
            MigrateError::RateLimited { .. } => Duration::ZERO,
            _ => self.backoff(attempt),
        }
    }
}

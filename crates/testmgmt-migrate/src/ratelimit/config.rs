//! Per-provider rate-limit settings.

use serde::{Deserialize, Serialize};

use super::reset::ResetMode;
use crate::error::{MigrateError, Result};

/// Largest accepted `backoff_factor`.
pub const MAX_BACKOFF_FACTOR: f64 = 100.0;

/// Throttle policy for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Hard cap on calls in any trailing 60 second window.
    pub max_requests_per_minute: u32,

    /// Delay applied before every released call when utilization is low.
    pub initial_delay_ms: u64,

    /// Upper bound for the adaptive delay.
    pub max_delay_ms: u64,

    /// Multiplier applied to the delay while above the threshold.
    pub backoff_factor: f64,

    /// Fraction of `max_requests_per_minute` at which backoff starts.
    pub backoff_threshold: f64,

    /// Response header carrying the reset time of a 429.
    pub reset_header: Option<String>,

    /// How to read `reset_header`.
    pub reset_mode: ResetMode,

    /// Consecutive failures that open the circuit.
    pub circuit_breaker_threshold: u32,

    /// How long an open circuit blocks calls.
    pub circuit_cooldown_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 60,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            backoff_threshold: 0.8,
            reset_header: Some("Retry-After".to_string()),
            reset_mode: ResetMode::Auto,
            circuit_breaker_threshold: 5,
            circuit_cooldown_ms: 30_000,
        }
    }
}

impl RateLimitConfig {
    pub fn with_max_requests(mut self, max_requests_per_minute: u32) -> Self {
        self.max_requests_per_minute = max_requests_per_minute;
        self
    }

    pub fn with_delays(mut self, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.initial_delay_ms = initial_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_reset_header(mut self, header: impl Into<String>, mode: ResetMode) -> Self {
        self.reset_header = Some(header.into());
        self.reset_mode = mode;
        self
    }

    pub fn with_circuit_breaker(mut self, threshold: u32, cooldown_ms: u64) -> Self {
        self.circuit_breaker_threshold = threshold;
        self.circuit_cooldown_ms = cooldown_ms;
        self
    }

    /// Reject settings the limiter cannot honor. `label` prefixes messages.
    pub fn validate(&self, label: &str) -> Result<()> {
        if self.max_requests_per_minute == 0 {
            return Err(MigrateError::validation(format!(
                "{}.max_requests_per_minute must be at least 1",
                label
            )));
        }
        if !(self.backoff_factor.is_finite()
            && self.backoff_factor >= 1.0
            && self.backoff_factor <= MAX_BACKOFF_FACTOR)
        {
            return Err(MigrateError::validation(format!(
                "{}.backoff_factor must be in [1.0, {}], got {}",
                label, MAX_BACKOFF_FACTOR, self.backoff_factor
            )));
        }
        if !(self.backoff_threshold > 0.0 && self.backoff_threshold <= 1.0) {
            return Err(MigrateError::validation(format!(
                "{}.backoff_threshold must be in (0, 1], got {}",
                label, self.backoff_threshold
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(MigrateError::validation(format!(
                "{}.max_delay_ms ({}) is below initial_delay_ms ({})",
                label, self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(MigrateError::validation(format!(
                "{}.circuit_breaker_threshold must be at least 1",
                label
            )));
        }
        Ok(())
    }
}

//! Adaptive per-provider rate limiter.
//!
//! Every outbound adapter call awaits [`RateLimiter::throttle`] first. State is
//! kept per provider name, so a throttled provider never delays another.
//!
//! Three mechanisms gate a call, checked in this order:
//!
//! - a hard deadline set by a 429 ([`RateLimiter::handle_rate_limit_response`])
//!   or by an open circuit ([`RateLimiter::record_failure`]);
//! - the sliding 60 second window capped at `max_requests_per_minute`;
//! - the adaptive delay, which grows by `backoff_factor` while utilization is
//!   at or above `backoff_threshold` and shrinks back toward
//!   `initial_delay_ms` below it.
//!
//! The limiter never fails; it only delays or reports.

pub mod config;
pub mod reset;

pub use config::RateLimitConfig;
pub use reset::{parse_reset, ResetExtractor, ResetMode, DEFAULT_RESET_MS};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{RetryAfter, Result};

/// Length of the sliding window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Cap on any single block, so absurd reset hints cannot overflow the clock.
const MAX_BLOCK: Duration = Duration::from_secs(24 * 60 * 60);

/// `delay * factor`, saturating at `ceiling`.
fn grow(delay: Duration, factor: f64, ceiling: Duration) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
        .unwrap_or(ceiling)
        .min(ceiling)
}

/// `delay / factor`, never below `floor`.
fn shrink(delay: Duration, factor: f64, floor: Duration) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() / factor)
        .unwrap_or(floor)
        .max(floor)
}

fn deadline(now: Instant, block: Duration) -> Instant {
    now + block.min(MAX_BLOCK)
}

/// Point-in-time view of one provider's limiter state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitMetrics {
    pub requests_last_minute: usize,
    pub current_delay_ms: u64,
    pub is_rate_limited: bool,
    pub consecutive_failures: u32,
    pub circuit_open: bool,
}

#[derive(Debug)]
struct ProviderState {
    /// Release instants of admitted calls; may include pending ones in the future.
    releases: VecDeque<Instant>,
    current_delay: Duration,
    consecutive_failures: u32,
    rate_limited_until: Option<Instant>,
    circuit_until: Option<Instant>,
    circuit_open: bool,
}

impl ProviderState {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            releases: VecDeque::new(),
            current_delay: Duration::from_millis(config.initial_delay_ms),
            consecutive_failures: 0,
            rate_limited_until: None,
            circuit_until: None,
            circuit_open: false,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.releases.front() {
            if now.duration_since(*front) >= WINDOW && *front <= now {
                self.releases.pop_front();
            } else {
                break;
            }
        }
    }

    fn hard_block(&self, now: Instant) -> Option<Instant> {
        self.rate_limited_until
            .into_iter()
            .chain(self.circuit_until)
            .filter(|until| *until > now)
            .max()
    }

    fn extend_deadline(&mut self, until: Instant) {
        self.rate_limited_until = Some(self.rate_limited_until.map_or(until, |u| u.max(until)));
    }

    fn extend_circuit(&mut self, until: Instant) {
        self.circuit_until = Some(self.circuit_until.map_or(until, |u| u.max(until)));
    }

    fn completed_in_window(&self, now: Instant) -> usize {
        self.releases
            .iter()
            .filter(|r| **r <= now && now.duration_since(**r) < WINDOW)
            .count()
    }
}

enum Decision {
    Wait(Instant),
    Release(Instant),
}

/// Process-wide limiter shared by every job and worker.
pub struct RateLimiter {
    default_config: RateLimitConfig,
    configs: DashMap<String, RateLimitConfig>,
    extractors: DashMap<String, Arc<dyn ResetExtractor>>,
    states: DashMap<String, Arc<Mutex<ProviderState>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    /// Create a limiter applying `default_config` to unconfigured providers.
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            configs: DashMap::new(),
            extractors: DashMap::new(),
            states: DashMap::new(),
        }
    }

    /// Like [`RateLimiter::new`], rejecting a default policy that fails validation.
    pub fn try_new(default_config: RateLimitConfig) -> Result<Self> {
        default_config.validate("rate_limits.default")?;
        Ok(Self::new(default_config))
    }

    /// Set the policy for one provider. Existing window state is kept.
    pub fn configure(&self, provider: impl Into<String>, config: RateLimitConfig) {
        self.configs.insert(provider.into(), config);
    }

    /// Register a provider-specific reset extractor.
    pub fn register_extractor(&self, provider: impl Into<String>, extractor: Arc<dyn ResetExtractor>) {
        self.extractors.insert(provider.into(), extractor);
    }

    pub fn config_for(&self, provider: &str) -> RateLimitConfig {
        self.configs
            .get(provider)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    fn state(&self, provider: &str) -> Arc<Mutex<ProviderState>> {
        if let Some(state) = self.states.get(provider) {
            return state.value().clone();
        }
        let config = self.config_for(provider);
        self.states
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ProviderState::new(&config))))
            .value()
            .clone()
    }

    /// Wait until a call to `provider` may be issued.
    pub async fn throttle(&self, provider: &str) {
        let config = self.config_for(provider);
        let state = self.state(provider);
        let max = config.max_requests_per_minute.max(1) as usize;
        let initial = Duration::from_millis(config.initial_delay_ms);
        let ceiling = Duration::from_millis(config.max_delay_ms);

        loop {
            let decision = {
                let mut s = state.lock();
                let now = Instant::now();
                s.prune(now);

                if let Some(until) = s.hard_block(now) {
                    Decision::Wait(until)
                } else if s.releases.len() >= max {
                    // Window full: the oldest admitted call frees a slot.
                    let oldest = s.releases.front().copied().unwrap_or(now);
                    Decision::Wait(oldest + WINDOW)
                } else {
                    let utilization = s.releases.len() as f64 / max as f64;
                    s.current_delay = if utilization >= config.backoff_threshold {
                        grow(s.current_delay.max(initial), config.backoff_factor, ceiling)
                    } else {
                        shrink(s.current_delay, config.backoff_factor, initial)
                    };
                    let release = now + s.current_delay;
                    s.releases.push_back(release);
                    Decision::Release(release)
                }
            };

            match decision {
                Decision::Wait(until) => {
                    debug!(
                        provider,
                        delay_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "Throttling"
                    );
                    tokio::time::sleep_until(until).await;
                }
                Decision::Release(at) => {
                    if at > Instant::now() {
                        tokio::time::sleep_until(at).await;
                    }
                    return;
                }
            }
        }
    }

    /// Block `provider` for `reset_ms` after a 429.
    pub fn handle_rate_limit_response(&self, provider: &str, reset_ms: u64) {
        let config = self.config_for(provider);
        let state = self.state(provider);
        let mut s = state.lock();
        s.extend_deadline(deadline(Instant::now(), Duration::from_millis(reset_ms)));

        let ceiling = Duration::from_millis(config.max_delay_ms);
        let current = s.current_delay.max(Duration::from_millis(config.initial_delay_ms));
        s.current_delay = grow(current, config.backoff_factor, ceiling);

        warn!(
            provider,
            reset_ms,
            delay_ms = s.current_delay.as_millis() as u64,
            "Rate limited by provider"
        );
    }

    /// Milliseconds until `provider` accepts calls again, from a 429 hint.
    ///
    /// A registered extractor wins; then the configured header; then
    /// [`DEFAULT_RESET_MS`].
    pub fn resolve_reset_ms(&self, provider: &str, hint: Option<&RetryAfter>) -> u64 {
        let headers = match hint {
            Some(RetryAfter::Millis(ms)) => return *ms,
            Some(RetryAfter::Headers(headers)) => headers,
            None => return DEFAULT_RESET_MS,
        };

        if let Some(extractor) = self.extractors.get(provider) {
            if let Some(ms) = extractor.extract(headers) {
                return ms;
            }
        }

        let config = self.config_for(provider);
        config
            .reset_header
            .as_deref()
            .and_then(|name| reset::header(headers, name))
            .and_then(|value| parse_reset(value, config.reset_mode, Utc::now()))
            .unwrap_or(DEFAULT_RESET_MS)
    }

    pub fn is_rate_limited(&self, provider: &str) -> bool {
        match self.states.get(provider) {
            Some(state) => state.lock().hard_block(Instant::now()).is_some(),
            None => false,
        }
    }

    pub fn get_metrics(&self, provider: &str) -> RateLimitMetrics {
        let state = self.state(provider);
        let s = state.lock();
        let now = Instant::now();
        RateLimitMetrics {
            requests_last_minute: s.completed_in_window(now),
            current_delay_ms: s.current_delay.as_millis() as u64,
            is_rate_limited: s.hard_block(now).is_some(),
            consecutive_failures: s.consecutive_failures,
            circuit_open: s.circuit_open && s.circuit_until.is_some_and(|until| until > now),
        }
    }

    /// Forget everything about `provider`.
    pub fn reset(&self, provider: &str) {
        if self.states.remove(provider).is_some() {
            info!(provider, "Rate limiter state reset");
        }
    }

    /// A call succeeded; closes an open circuit. A pending 429 deadline stays.
    pub fn record_success(&self, provider: &str) {
        let state = self.state(provider);
        let mut s = state.lock();
        s.consecutive_failures = 0;
        if s.circuit_open {
            s.circuit_open = false;
            s.circuit_until = None;
            info!(provider, "Circuit closed");
        }
    }

    /// A call failed; opens the circuit once the threshold is crossed.
    pub fn record_failure(&self, provider: &str) {
        let config = self.config_for(provider);
        let state = self.state(provider);
        let mut s = state.lock();
        s.consecutive_failures += 1;
        if s.consecutive_failures >= config.circuit_breaker_threshold {
            s.extend_circuit(deadline(Instant::now(), Duration::from_millis(config.circuit_cooldown_ms)));
            if !s.circuit_open {
                warn!(
                    provider,
                    failures = s.consecutive_failures,
                    cooldown_ms = config.circuit_cooldown_ms,
                    "Circuit opened"
                );
            }
            s.circuit_open = true;
        }
    }

    /// Apply a header map directly, e.g. from an adapter that only has raw headers.
    pub fn handle_rate_limit_headers(&self, provider: &str, headers: HashMap<String, String>) {
        let reset_ms = self.resolve_reset_ms(provider, Some(&RetryAfter::Headers(headers)));
        self.handle_rate_limit_response(provider, reset_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> RateLimitConfig {
        RateLimitConfig::default()
            .with_max_requests(100)
            .with_delays(0, 1_000)
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_waits_for_rate_limit_deadline() {
        let limiter = RateLimiter::new(fast());
        limiter.handle_rate_limit_response("zephyr", 5_000);
        assert!(limiter.is_rate_limited("zephyr"));

        let start = Instant::now();
        limiter.throttle("zephyr").await;
        assert!(start.elapsed() >= Duration::from_millis(5_000));
        assert!(!limiter.is_rate_limited("zephyr"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_providers_are_independent() {
        let limiter = RateLimiter::new(fast());
        limiter.handle_rate_limit_response("zephyr", 5_000);

        let start = Instant::now();
        limiter.throttle("qtest").await;
        assert!(start.elapsed() < Duration::from_millis(5_000));
        assert!(!limiter.is_rate_limited("qtest"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_count_completed_calls_in_window() {
        let limiter = RateLimiter::new(fast());
        for _ in 0..7 {
            limiter.throttle("qtest").await;
        }
        assert_eq!(limiter.get_metrics("qtest").requests_last_minute, 7);

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.throttle("qtest").await;
        assert_eq!(limiter.get_metrics("qtest").requests_last_minute, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_cap_delays_excess_calls() {
        let limiter = RateLimiter::new(fast().with_max_requests(3));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.throttle("rally").await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        limiter.throttle("rally").await;
        assert!(start.elapsed() >= WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_grows_above_threshold_and_decays_below() {
        let config = RateLimitConfig {
            max_requests_per_minute: 10,
            initial_delay_ms: 10,
            max_delay_ms: 80,
            backoff_factor: 2.0,
            backoff_threshold: 0.5,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config);

        for _ in 0..5 {
            limiter.throttle("alm").await;
        }
        assert_eq!(limiter.get_metrics("alm").current_delay_ms, 10);

        limiter.throttle("alm").await;
        assert_eq!(limiter.get_metrics("alm").current_delay_ms, 20);
        limiter.throttle("alm").await;
        limiter.throttle("alm").await;
        limiter.throttle("alm").await;
        assert_eq!(limiter.get_metrics("alm").current_delay_ms, 80);

        tokio::time::advance(WINDOW).await;
        limiter.throttle("alm").await;
        assert_eq!(limiter.get_metrics("alm").current_delay_ms, 40);
        limiter.throttle("alm").await;
        limiter.throttle("alm").await;
        assert_eq!(limiter.get_metrics("alm").current_delay_ms, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold_and_closes_on_success() {
        let limiter = RateLimiter::new(fast().with_circuit_breaker(3, 2_000));
        limiter.record_failure("jama");
        limiter.record_failure("jama");
        assert!(!limiter.is_rate_limited("jama"));

        limiter.record_failure("jama");
        let metrics = limiter.get_metrics("jama");
        assert!(metrics.circuit_open);
        assert_eq!(metrics.consecutive_failures, 3);

        let start = Instant::now();
        limiter.throttle("jama").await;
        assert!(start.elapsed() >= Duration::from_millis(2_000));

        limiter.record_failure("jama");
        assert!(limiter.is_rate_limited("jama"));
        limiter.record_success("jama");
        assert!(!limiter.is_rate_limited("jama"));
        assert_eq!(limiter.get_metrics("jama").consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_circuit_keeps_rate_limit_deadline() {
        let limiter = RateLimiter::new(fast().with_circuit_breaker(1, 1_000));
        limiter.record_failure("jama");
        limiter.handle_rate_limit_response("jama", 5_000);

        limiter.record_success("jama");
        let metrics = limiter.get_metrics("jama");
        assert!(!metrics.circuit_open);
        assert!(metrics.is_rate_limited);

        let start = Instant::now();
        limiter.throttle("jama").await;
        assert!(start.elapsed() >= Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_backoff_factor_saturates_at_ceiling() {
        let config = RateLimitConfig {
            backoff_factor: f64::INFINITY,
            backoff_threshold: 0.01,
            ..fast()
        };
        assert!(RateLimiter::try_new(config.clone()).is_err());

        let limiter = RateLimiter::new(config);
        limiter.handle_rate_limit_response("qtest", 1_000);
        assert_eq!(limiter.get_metrics("qtest").current_delay_ms, 1_000);

        limiter.throttle("qtest").await;
        limiter.throttle("qtest").await;
        assert_eq!(limiter.get_metrics("qtest").current_delay_ms, 1_000);

        limiter.handle_rate_limit_response("qtest", u64::MAX);
        assert!(limiter.is_rate_limited("qtest"));
    }

    #[test]
    fn test_grow_and_shrink_never_panic() {
        let ceiling = Duration::from_millis(500);
        let floor = Duration::from_millis(10);
        assert_eq!(grow(Duration::from_millis(100), 1e300, ceiling), ceiling);
        assert_eq!(grow(Duration::from_millis(100), f64::NAN, ceiling), ceiling);
        assert_eq!(grow(Duration::from_millis(100), 2.0, ceiling), Duration::from_millis(200));
        assert_eq!(shrink(Duration::from_millis(100), 0.0, floor), floor);
        assert_eq!(shrink(Duration::from_millis(100), f64::INFINITY, floor), floor);
        assert_eq!(shrink(Duration::from_millis(100), 2.0, floor), Duration::from_millis(50));
    }

    #[test]
    fn test_resolve_reset_prefers_extractor_then_header() {
        let limiter = RateLimiter::new(fast());
        limiter.configure(
            "testrail",
            fast().with_reset_header("X-RateLimit-Reset-After", ResetMode::Seconds),
        );
        let headers = HashMap::from([("x-ratelimit-reset-after".to_string(), "7".to_string())]);
        let hint = RetryAfter::Headers(headers.clone());
        assert_eq!(limiter.resolve_reset_ms("testrail", Some(&hint)), 7_000);

        limiter.register_extractor(
            "testrail",
            Arc::new(|h: &HashMap<String, String>| h.get("x-ratelimit-reset-after").map(|_| 1_234)),
        );
        assert_eq!(limiter.resolve_reset_ms("testrail", Some(&hint)), 1_234);

        assert_eq!(limiter.resolve_reset_ms("testrail", Some(&RetryAfter::Millis(50))), 50);
        assert_eq!(limiter.resolve_reset_ms("unknown", None), DEFAULT_RESET_MS);
        let empty = RetryAfter::Headers(HashMap::new());
        assert_eq!(limiter.resolve_reset_ms("unknown", Some(&empty)), DEFAULT_RESET_MS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_state() {
        let limiter = RateLimiter::new(fast());
        limiter.handle_rate_limit_response("azure", 10_000);
        limiter.reset("azure");
        assert!(!limiter.is_rate_limited("azure"));
        assert_eq!(limiter.get_metrics("azure").requests_last_minute, 0);
    }
}

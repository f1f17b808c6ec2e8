use std::time::Duration;

use common::config::AppConfig;

/// Exponential backoff for roster fetches.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Runtime knobs of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on a single roster fetch.
    pub roster_timeout: Duration,
    pub roster_retry: RetryPolicy,
    /// Pending background sync jobs before enqueueing waits.
    pub sync_queue_capacity: usize,
    /// Conditional-write attempts for one best-submission update.
    pub max_cas_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            roster_timeout: Duration::from_secs(5),
            roster_retry: RetryPolicy::default(),
            sync_queue_capacity: 256,
            max_cas_attempts: 8,
        }
    }
}

impl From<&AppConfig> for EngineConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            roster_timeout: Duration::from_millis(cfg.roster_timeout_ms),
            roster_retry: RetryPolicy {
                max_attempts: cfg.roster_retry_max_attempts.max(1),
                initial_delay: Duration::from_millis(cfg.roster_retry_initial_delay_ms),
                max_delay: Duration::from_millis(cfg.roster_retry_max_delay_ms),
                ..RetryPolicy::default()
            },
            sync_queue_capacity: cfg.roster_sync_queue_capacity.max(1),
            ..EngineConfig::default()
        }
    }
}

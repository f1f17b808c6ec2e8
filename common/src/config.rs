//! Global application configuration manager.
//!
//! `AppConfig` is a lazily initialized, globally accessible singleton holding
//! runtime configuration loaded from `.env` and environment variables. Tests
//! can override individual fields through the per-field setters.

use std::env;
use std::str::FromStr;
use std::sync::{OnceLock, RwLock, RwLockReadGuard};

/// Complete runtime configuration for the engine and its binaries.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: String,
    pub project_name: String,
    pub log_level: String,
    pub log_file: String,
    pub log_to_stdout: bool,
    pub database_path: String,
    /// Base URL of the external roster service.
    pub roster_service_url: String,
    pub roster_timeout_ms: u64,
    pub roster_retry_max_attempts: u32,
    pub roster_retry_initial_delay_ms: u64,
    pub roster_retry_max_delay_ms: u64,
    pub roster_sync_queue_capacity: usize,
    pub reconcile_interval_seconds: u64,
}

static CONFIG_INSTANCE: OnceLock<RwLock<AppConfig>> = OnceLock::new();

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// Loads the configuration from `.env` and the process environment.
    ///
    /// Malformed numeric values fall back to their defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            env: var_or("APP_ENV", "development"),
            project_name: var_or("PROJECT_NAME", "classroom-engine"),
            log_level: var_or("LOG_LEVEL", "services=info,db=info"),
            log_file: var_or("LOG_FILE", "engine.log"),
            log_to_stdout: var_or("LOG_TO_STDOUT", "false") == "true",
            database_path: var_or("DATABASE_PATH", "data/classroom.db"),
            roster_service_url: var_or("ROSTER_SERVICE_URL", "http://127.0.0.1:4000"),
            roster_timeout_ms: parse_or("ROSTER_TIMEOUT_MS", 5_000),
            roster_retry_max_attempts: parse_or("ROSTER_RETRY_MAX_ATTEMPTS", 5),
            roster_retry_initial_delay_ms: parse_or("ROSTER_RETRY_INITIAL_DELAY_MS", 500),
            roster_retry_max_delay_ms: parse_or("ROSTER_RETRY_MAX_DELAY_MS", 30_000),
            roster_sync_queue_capacity: parse_or("ROSTER_SYNC_QUEUE_CAPACITY", 256),
            reconcile_interval_seconds: parse_or("RECONCILE_INTERVAL_SECONDS", 300),
        }
    }

    /// Returns a shared reference to the global configuration.
    ///
    /// # Panics
    /// Panics if the lock is poisoned.
    pub fn global() -> RwLockReadGuard<'static, AppConfig> {
        CONFIG_INSTANCE
            .get_or_init(|| RwLock::new(AppConfig::from_env()))
            .read()
            .expect("Failed to acquire AppConfig read lock")
    }

    /// Reloads the configuration from the environment, dropping overrides.
    pub fn reset() {
        if let Some(lock) = CONFIG_INSTANCE.get() {
            let mut guard = lock.write().expect("Failed to acquire AppConfig write lock");
            *guard = AppConfig::from_env();
        }
    }

    fn set_field<F>(setter: F)
    where
        F: FnOnce(&mut AppConfig),
    {
        let lock = CONFIG_INSTANCE.get_or_init(|| RwLock::new(AppConfig::from_env()));
        let mut guard = lock
            .write()
            .expect("Failed to acquire AppConfig write lock");
        setter(&mut guard);
    }

    // --- Per-field setters below ---

    pub fn set_env(value: impl Into<String>) {
        AppConfig::set_field(|cfg| cfg.env = value.into());
    }

    pub fn set_log_level(value: impl Into<String>) {
        AppConfig::set_field(|cfg| cfg.log_level = value.into());
    }

    pub fn set_log_to_stdout(value: bool) {
        AppConfig::set_field(|cfg| cfg.log_to_stdout = value);
    }

    pub fn set_database_path(value: impl Into<String>) {
        AppConfig::set_field(|cfg| cfg.database_path = value.into());
    }

    pub fn set_roster_service_url(value: impl Into<String>) {
        AppConfig::set_field(|cfg| cfg.roster_service_url = value.into());
    }

    pub fn set_roster_timeout_ms(value: u64) {
        AppConfig::set_field(|cfg| cfg.roster_timeout_ms = value);
    }

    pub fn set_roster_retry_max_attempts(value: u32) {
        AppConfig::set_field(|cfg| cfg.roster_retry_max_attempts = value);
    }

    pub fn set_roster_sync_queue_capacity(value: usize) {
        AppConfig::set_field(|cfg| cfg.roster_sync_queue_capacity = value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn malformed_numbers_fall_back_to_defaults() {
        env::set_var("ROSTER_TIMEOUT_MS", "soon");
        env::set_var("ROSTER_RETRY_MAX_ATTEMPTS", "7");

        let cfg = AppConfig::from_env();
        assert_eq!(cfg.roster_timeout_ms, 5_000);
        assert_eq!(cfg.roster_retry_max_attempts, 7);

        env::remove_var("ROSTER_TIMEOUT_MS");
        env::remove_var("ROSTER_RETRY_MAX_ATTEMPTS");
    }

    #[test]
    #[serial]
    fn setters_override_global_until_reset() {
        AppConfig::set_roster_service_url("http://roster.test");
        assert_eq!(AppConfig::global().roster_service_url, "http://roster.test");

        AppConfig::reset();
        assert_ne!(AppConfig::global().roster_service_url, "http://roster.test");
    }
}

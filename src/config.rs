//! Configuration module for upwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::monitor::{UptimePolicy, DEFAULT_HISTORY_CAPACITY};

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the SQLite database file (default: "upwatch.db")
    pub db_path: String,
    /// Maximum probes in flight across all monitors (default: 64)
    pub max_concurrent_probes: usize,
    /// Smallest interval a monitor may use (default: 5s)
    pub min_interval: Duration,
    /// Entries kept in each monitor's status history (default: 30)
    pub history_capacity: usize,
    /// Uptime estimator steps (default: +0.1 / -0.5)
    pub uptime: UptimePolicy,
    /// Attempts per store write before it is parked (default: 5)
    pub store_retry_attempts: u32,
    /// First backoff delay between store attempts (default: 200ms)
    pub store_retry_base: Duration,
    /// Upper bound of the random delay before a monitor's first tick (default: 1s)
    pub startup_jitter: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "upwatch.db".to_string(),
            max_concurrent_probes: 64,
            min_interval: Duration::from_secs(5),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            uptime: UptimePolicy::default(),
            store_retry_attempts: 5,
            store_retry_base: Duration::from_millis(200),
            startup_jitter: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPWATCH_DB_PATH`: Database file path (default: "upwatch.db")
    /// - `UPWATCH_MAX_CONCURRENT_PROBES`: global probe pool size (default: 64)
    /// - `UPWATCH_MIN_INTERVAL_SECS`: minimum monitor interval (default: 5)
    /// - `UPWATCH_HISTORY_CAPACITY`: status history length (default: 30)
    /// - `UPWATCH_UPTIME_UP_STEP` / `UPWATCH_UPTIME_DOWN_STEP`: uptime steps (default: 0.1 / 0.5)
    /// - `UPWATCH_STORE_RETRY_ATTEMPTS`: store write attempts (default: 5)
    /// - `UPWATCH_STORE_RETRY_BASE_MS`: first store retry delay (default: 200)
    /// - `UPWATCH_STARTUP_JITTER_MS`: first-tick spread (default: 1000)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(db_path) = env::var("UPWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(n) = parse_var::<usize>("UPWATCH_MAX_CONCURRENT_PROBES").filter(|n| *n > 0) {
            cfg.max_concurrent_probes = n;
        }
        if let Some(secs) = parse_var::<u64>("UPWATCH_MIN_INTERVAL_SECS").filter(|s| *s > 0) {
            cfg.min_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<usize>("UPWATCH_HISTORY_CAPACITY").filter(|n| *n > 0) {
            cfg.history_capacity = n;
        }

        let up = parse_var::<f64>("UPWATCH_UPTIME_UP_STEP").unwrap_or(cfg.uptime.up_step);
        let down = parse_var::<f64>("UPWATCH_UPTIME_DOWN_STEP").unwrap_or(cfg.uptime.down_step);
        match UptimePolicy::new(up, down) {
            Some(policy) => cfg.uptime = policy,
            None => tracing::warn!(
                "Ignoring uptime steps up={} down={}: both must be positive and down > up",
                up,
                down
            ),
        }

        if let Some(n) = parse_var::<u32>("UPWATCH_STORE_RETRY_ATTEMPTS").filter(|n| *n > 0) {
            cfg.store_retry_attempts = n;
        }
        if let Some(ms) = parse_var::<u64>("UPWATCH_STORE_RETRY_BASE_MS") {
            cfg.store_retry_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("UPWATCH_STARTUP_JITTER_MS") {
            cfg.startup_jitter = Duration::from_millis(ms);
        }

        cfg
    }
}

fn parse_var<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.db_path, "upwatch.db");
        assert_eq!(cfg.max_concurrent_probes, 64);
        assert_eq!(cfg.min_interval, Duration::from_secs(5));
        assert_eq!(cfg.history_capacity, 30);
        assert!(cfg.uptime.down_step > cfg.uptime.up_step);
    }

    #[test]
    fn test_load_from_env() {
        env::set_var("UPWATCH_HISTORY_CAPACITY", "50");
        env::set_var("UPWATCH_MAX_CONCURRENT_PROBES", "not-a-number");
        env::set_var("UPWATCH_UPTIME_UP_STEP", "2.0");
        env::set_var("UPWATCH_UPTIME_DOWN_STEP", "1.0");

        let cfg = EngineConfig::load();
        assert_eq!(cfg.history_capacity, 50);
        assert_eq!(cfg.max_concurrent_probes, 64);
        // Symmetric or inverted steps are rejected.
        assert_eq!(cfg.uptime, UptimePolicy::default());

        env::remove_var("UPWATCH_HISTORY_CAPACITY");
        env::remove_var("UPWATCH_MAX_CONCURRENT_PROBES");
        env::remove_var("UPWATCH_UPTIME_UP_STEP");
        env::remove_var("UPWATCH_UPTIME_DOWN_STEP");
    }
}

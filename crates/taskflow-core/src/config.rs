//! Application configuration loaded from environment variables.
//!
//! Follows the teacher's `Config::from_env()` convention: load `.env` if
//! present (development convenience only, errors ignored), required
//! values via `.context("X must be set")`, defaulted tuning knobs via
//! `.unwrap_or_else`.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Tunables and connection info shared by the coordinator and worker
/// binaries. Defaults are taken from spec.md §6, cross-checked against
/// `core/queue_manager.py`'s literal constants in the reference
/// implementation.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub broker_host_high: String,
    pub broker_port_high: u16,
    pub broker_host_low: String,
    pub broker_port_low: u16,

    pub max_retries: i32,
    pub lease_ttl_ms: i64,
    pub renew_interval_s: u64,
    pub scheduler_interval_s: u64,
    pub reclaim_interval_s: u64,
    pub processing_reclaim_s: i64,
    pub heartbeat_interval_s: u64,
    pub heartbeat_ttl_s: i64,
    pub task_timeout_s: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,

            broker_host_high: env::var("BROKER_HOST_HIGH")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            broker_port_high: env::var("BROKER_PORT_HIGH")
                .unwrap_or_else(|_| "6379".to_string())
                .parse()
                .context("BROKER_PORT_HIGH must be a valid port")?,
            broker_host_low: env::var("BROKER_HOST_LOW")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            broker_port_low: env::var("BROKER_PORT_LOW")
                .unwrap_or_else(|_| "6380".to_string())
                .parse()
                .context("BROKER_PORT_LOW must be a valid port")?,

            max_retries: parse_env_or("MAX_RETRIES", 3)?,
            lease_ttl_ms: parse_env_or("LEASE_TTL_MS", 10_000)?,
            renew_interval_s: parse_env_or("RENEW_INTERVAL_S", 3)?,
            scheduler_interval_s: parse_env_or("SCHEDULER_INTERVAL_S", 5)?,
            reclaim_interval_s: parse_env_or("RECLAIM_INTERVAL_S", 10)?,
            processing_reclaim_s: parse_env_or("PROCESSING_RECLAIM_S", 30)?,
            heartbeat_interval_s: parse_env_or("HEARTBEAT_INTERVAL", 3)?,
            heartbeat_ttl_s: parse_env_or("HEARTBEAT_TTL", 10)?,
            task_timeout_s: parse_env_or("TASK_TIMEOUT", 180)?,
        })
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_s)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_s)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_s)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_s)
    }
}

fn parse_env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} must be a valid value: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_or_falls_back_to_default_when_unset() {
        env::remove_var("TASKFLOW_TEST_UNSET_VAR");
        let value: i32 = parse_env_or("TASKFLOW_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_env_or_uses_set_value() {
        env::set_var("TASKFLOW_TEST_SET_VAR", "17");
        let value: i32 = parse_env_or("TASKFLOW_TEST_SET_VAR", 42).unwrap();
        assert_eq!(value, 17);
        env::remove_var("TASKFLOW_TEST_SET_VAR");
    }
}

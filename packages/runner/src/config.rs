//! Process configuration loaded from environment variables.
//!
//! Everything here is read once at startup and injected into component
//! constructors; nothing reads the environment on the hot path.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use router_client::RouterConfig;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub queue_url: String,
    pub router: RouterConfig,
    /// Outbox topic / queue name (`JOBS_QUEUE_NAME`).
    pub jobs_queue_name: String,
    /// `ENABLE_DB_TRACING`; off by default.
    pub enable_db_tracing: bool,
    /// `DB_AUDIT`; verbose SQL statement logging.
    pub db_audit: bool,
    /// Per-task inference deadline. Defaults to the router timeout.
    pub task_deadline: Duration,
    /// Recovery sweeper: `processing` jobs untouched for longer than this
    /// are reset to `created`.
    pub stale_threshold: Duration,
    /// Timeout sweeper: `processing` jobs older than this are failed.
    pub timeout_threshold: Duration,
    /// Sweep loop interval for both sweepers.
    pub sweep_interval: Duration,
    /// Max in-flight tasks per job.
    pub job_concurrency: usize,
    /// Max concurrent calls against the router across all jobs.
    pub router_concurrency: usize,
    /// Number of job-runner workers consuming the queue.
    pub worker_count: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let router = RouterConfig::from_env();
        let task_deadline = router.timeout;

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            queue_url: env::var("QUEUE_URL").context("QUEUE_URL must be set")?,
            router,
            jobs_queue_name: env::var("JOBS_QUEUE_NAME").unwrap_or_else(|_| "jobs".to_string()),
            enable_db_tracing: env_flag("ENABLE_DB_TRACING"),
            db_audit: env_flag("DB_AUDIT"),
            task_deadline,
            stale_threshold: env_secs("RECOVERY_STALE_SECS", 600)?,
            timeout_threshold: env_secs("JOB_TIMEOUT_SECS", 1200)?,
            sweep_interval: env_secs("SWEEP_INTERVAL_SECS", 60)?,
            job_concurrency: env_usize("JOB_CONCURRENCY", 8)?,
            router_concurrency: env_usize("ROUTER_CONCURRENCY", 4)?,
            worker_count: env_usize("WORKER_COUNT", 4)?,
        })
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_secs(name: &str, default: u64) -> Result<Duration> {
    let secs = match env::var(name) {
        Ok(v) => v
            .parse::<u64>()
            .with_context(|| format!("{name} must be a number of seconds"))?,
        Err(_) => default,
    };
    Ok(Duration::from_secs(secs))
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(v) => v
            .parse::<usize>()
            .with_context(|| format!("{name} must be a positive integer")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_truthy_values() {
        for v in ["1", "true", "YES", "on"] {
            env::set_var("CONFIG_TEST_FLAG_A", v);
            assert!(env_flag("CONFIG_TEST_FLAG_A"), "{v} should be truthy");
        }
        env::set_var("CONFIG_TEST_FLAG_A", "0");
        assert!(!env_flag("CONFIG_TEST_FLAG_A"));
        env::remove_var("CONFIG_TEST_FLAG_A");
        assert!(!env_flag("CONFIG_TEST_FLAG_A"));
    }

    #[test]
    fn durations_fall_back_to_defaults() {
        env::remove_var("CONFIG_TEST_SECS");
        assert_eq!(
            env_secs("CONFIG_TEST_SECS", 600).unwrap(),
            Duration::from_secs(600)
        );
        env::set_var("CONFIG_TEST_SECS", "25");
        assert_eq!(
            env_secs("CONFIG_TEST_SECS", 600).unwrap(),
            Duration::from_secs(25)
        );
        env::set_var("CONFIG_TEST_SECS", "not-a-number");
        assert!(env_secs("CONFIG_TEST_SECS", 600).is_err());
        env::remove_var("CONFIG_TEST_SECS");
    }
}

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backoff::BackoffPolicy;
use crate::error::{ConfigError, Result};

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 15;
pub const MIN_MAX_ATTEMPTS: u32 = 1;
pub const MAX_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SCHEDULE_GRACE_SECS: u64 = 5;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const MAX_CONCURRENCY: usize = 256;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_MAX_IDLE_MS: u64 = 5_000;
pub const DEFAULT_LEASE_CHECK_INTERVAL_SECS: u64 = 60;

/// Top-level config (jobq.toml + JOBQ_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobqConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Order in which due jobs are handed to workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Fresh jobs (attempts = 0) first, retries fill the remainder.
    #[default]
    FreshFirst,
    /// One pass over every due job, priority then FIFO.
    Unified,
}

/// Queue engine behaviour shared by producers and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Used when a producer does not pass `max_attempts`.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// Tolerated lag between a caller's "now" and the engine's when a
    /// `scheduled_at` is validated.
    #[serde(default = "default_schedule_grace_secs")]
    pub schedule_grace_secs: u64,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default)]
    pub selection: SelectionPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            schedule_grace_secs: DEFAULT_SCHEDULE_GRACE_SECS,
            backoff: BackoffPolicy::default(),
            selection: SelectionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum jobs in flight per worker.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Base sleep between polls when no job is ready.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Ceiling for the idle sleep, which doubles on every empty poll.
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
    /// Jobs stuck in processing longer than this are reclaimed.
    /// `None` disables lease recovery.
    #[serde(default)]
    pub lease_timeout_secs: Option<u64>,
    #[serde(default = "default_lease_check_interval_secs")]
    pub lease_check_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_idle_ms: DEFAULT_MAX_IDLE_MS,
            lease_timeout_secs: None,
            lease_check_interval_secs: DEFAULT_LEASE_CHECK_INTERVAL_SECS,
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobq/jobq.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_schedule_grace_secs() -> u64 {
    DEFAULT_SCHEDULE_GRACE_SECS
}
fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_max_idle_ms() -> u64 {
    DEFAULT_MAX_IDLE_MS
}
fn default_lease_check_interval_secs() -> u64 {
    DEFAULT_LEASE_CHECK_INTERVAL_SECS
}

impl JobqConfig {
    /// Load config from a TOML file with JOBQ_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `JOBQ_WORKER__CONCURRENCY=8`.
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: JobqConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("JOBQ_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        config.validate()?;
        debug!(%path, db = %config.database.path, "configuration loaded");
        Ok(config)
    }

    /// Reject values the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        let q = &self.queue;
        if !(MIN_MAX_ATTEMPTS..=MAX_MAX_ATTEMPTS).contains(&q.default_max_attempts) {
            return Err(ConfigError::invalid(
                "queue.default_max_attempts",
                format!("must be between {MIN_MAX_ATTEMPTS} and {MAX_MAX_ATTEMPTS}"),
            ));
        }
        q.backoff.validate()?;

        let w = &self.worker;
        if w.concurrency == 0 || w.concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::invalid(
                "worker.concurrency",
                format!("must be between 1 and {MAX_CONCURRENCY}"),
            ));
        }
        if w.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("worker.poll_interval_ms", "must be positive"));
        }
        if w.max_idle_ms < w.poll_interval_ms {
            return Err(ConfigError::invalid(
                "worker.max_idle_ms",
                "must not be smaller than worker.poll_interval_ms",
            ));
        }
        if w.lease_timeout_secs == Some(0) {
            return Err(ConfigError::invalid("worker.lease_timeout_secs", "must be positive"));
        }
        if w.lease_check_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "worker.lease_check_interval_secs",
                "must be positive",
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobq/jobq.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(JobqConfig::default().validate().is_ok());
    }

    #[test]
    fn toml_and_env_are_merged() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "jobq.toml",
                r#"
                [database]
                path = "/tmp/jobs.db"

                [queue]
                default_max_attempts = 5
                selection = "unified"

                [queue.backoff]
                kind = "fixed"
                secs = 30
                "#,
            )?;
            jail.set_env("JOBQ_WORKER__CONCURRENCY", "8");

            let config = JobqConfig::load(Some("jobq.toml")).expect("load failed");
            assert_eq!(config.database.path, "/tmp/jobs.db");
            assert_eq!(config.queue.default_max_attempts, 5);
            assert_eq!(config.queue.selection, SelectionPolicy::Unified);
            assert_eq!(config.queue.backoff, BackoffPolicy::Fixed { secs: 30 });
            assert_eq!(config.worker.concurrency, 8);
            assert_eq!(config.worker.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
            Ok(())
        });
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = JobqConfig::load(Some("does-not-exist.toml")).expect("load failed");
            assert_eq!(config.queue.default_max_attempts, DEFAULT_MAX_ATTEMPTS);
            assert_eq!(config.queue.selection, SelectionPolicy::FreshFirst);
            Ok(())
        });
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = JobqConfig::default();
        config.worker.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "worker.concurrency"
        ));
    }

    #[test]
    fn oversized_concurrency_rejected() {
        let mut config = JobqConfig::default();
        config.worker.concurrency = MAX_CONCURRENCY;
        assert!(config.validate().is_ok());
        config.worker.concurrency = usize::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "worker.concurrency"
        ));
    }

    #[test]
    fn out_of_range_default_attempts_rejected() {
        let mut config = JobqConfig::default();
        config.queue.default_max_attempts = 11;
        assert!(config.validate().is_err());
        config.queue.default_max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn idle_ceiling_below_poll_interval_rejected() {
        let mut config = JobqConfig::default();
        config.worker.poll_interval_ms = 1_000;
        config.worker.max_idle_ms = 500;
        assert!(config.validate().is_err());
    }
}

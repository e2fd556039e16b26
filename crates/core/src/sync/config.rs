//! Engine configuration.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

use super::retry::RetryPolicy;

pub const ENV_PREFIX: &str = "MENU_SYNC_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncEngineConfig {
    /// When off, every trigger sends a full resync and no snapshots or deltas are kept.
    pub versioning_enabled: bool,
    pub job_lock_stale_secs: i64,
    pub job_bucket_secs: i64,
    pub content_lock_stale_secs: i64,
    pub snapshot_retention_days: i64,
    pub delta_retention_days: i64,
    pub run_retention_days: i64,
    pub deletion_retention_days: i64,
    pub idempotency_retention_days: i64,
    pub fetch_retry_attempts: u32,
    pub submission_retry_attempts: u32,
    /// Attempts for a transient failure of a single store write inside a run.
    pub persistence_retry_attempts: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_cap_secs: u64,
    pub retry_jitter_ms: u64,
    pub dlq_max_attempts: i32,
    pub max_run_retries: i32,
    pub store_catalog_payload: bool,
    pub partition_remote_codes_by_menu_group: bool,
    pub max_concurrent_scopes: usize,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            versioning_enabled: true,
            job_lock_stale_secs: 1800,
            job_bucket_secs: 900,
            content_lock_stale_secs: 600,
            snapshot_retention_days: 90,
            delta_retention_days: 30,
            run_retention_days: 30,
            deletion_retention_days: 90,
            idempotency_retention_days: 7,
            fetch_retry_attempts: 3,
            submission_retry_attempts: 3,
            persistence_retry_attempts: 3,
            retry_backoff_base_ms: 1000,
            retry_backoff_cap_secs: 1800,
            retry_jitter_ms: 0,
            dlq_max_attempts: 5,
            max_run_retries: 3,
            store_catalog_payload: true,
            partition_remote_codes_by_menu_group: false,
            max_concurrent_scopes: 4,
        }
    }
}

fn env_override<T: FromStr>(name: &str, target: &mut T) -> Result<()> {
    let key = format!("{}{}", ENV_PREFIX, name);
    match std::env::var(&key) {
        Ok(raw) => {
            *target = raw
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("Invalid value for {}: {:?}", key, raw)))?;
            Ok(())
        }
        Err(std::env::VarError::NotPresent) => Ok(()),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(Error::Config(format!("{} is not valid unicode", key)))
        }
    }
}

impl SyncEngineConfig {
    /// Defaults overridden by `MENU_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        env_override("VERSIONING_ENABLED", &mut config.versioning_enabled)?;
        env_override("JOB_LOCK_STALE_SECS", &mut config.job_lock_stale_secs)?;
        env_override("JOB_BUCKET_SECS", &mut config.job_bucket_secs)?;
        env_override("CONTENT_LOCK_STALE_SECS", &mut config.content_lock_stale_secs)?;
        env_override("SNAPSHOT_RETENTION_DAYS", &mut config.snapshot_retention_days)?;
        env_override("DELTA_RETENTION_DAYS", &mut config.delta_retention_days)?;
        env_override("RUN_RETENTION_DAYS", &mut config.run_retention_days)?;
        env_override("DELETION_RETENTION_DAYS", &mut config.deletion_retention_days)?;
        env_override("IDEMPOTENCY_RETENTION_DAYS", &mut config.idempotency_retention_days)?;
        env_override("FETCH_RETRY_ATTEMPTS", &mut config.fetch_retry_attempts)?;
        env_override("SUBMISSION_RETRY_ATTEMPTS", &mut config.submission_retry_attempts)?;
        env_override("PERSISTENCE_RETRY_ATTEMPTS", &mut config.persistence_retry_attempts)?;
        env_override("RETRY_BACKOFF_BASE_MS", &mut config.retry_backoff_base_ms)?;
        env_override("RETRY_BACKOFF_CAP_SECS", &mut config.retry_backoff_cap_secs)?;
        env_override("RETRY_JITTER_MS", &mut config.retry_jitter_ms)?;
        env_override("DLQ_MAX_ATTEMPTS", &mut config.dlq_max_attempts)?;
        env_override("MAX_RUN_RETRIES", &mut config.max_run_retries)?;
        env_override("STORE_CATALOG_PAYLOAD", &mut config.store_catalog_payload)?;
        env_override(
            "PARTITION_REMOTE_CODES_BY_MENU_GROUP",
            &mut config.partition_remote_codes_by_menu_group,
        )?;
        env_override("MAX_CONCURRENT_SCOPES", &mut config.max_concurrent_scopes)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON document; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Invalid sync engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("jobLockStaleSecs", self.job_lock_stale_secs),
            ("jobBucketSecs", self.job_bucket_secs),
            ("contentLockStaleSecs", self.content_lock_stale_secs),
            ("snapshotRetentionDays", self.snapshot_retention_days),
            ("deltaRetentionDays", self.delta_retention_days),
            ("runRetentionDays", self.run_retention_days),
            ("deletionRetentionDays", self.deletion_retention_days),
            ("idempotencyRetentionDays", self.idempotency_retention_days),
            ("dlqMaxAttempts", i64::from(self.dlq_max_attempts)),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value <= 0) {
            return Err(Error::Config(format!("{} must be positive", name)));
        }
        if self.fetch_retry_attempts == 0
            || self.submission_retry_attempts == 0
            || self.persistence_retry_attempts == 0
        {
            return Err(Error::Config("Retry attempts must be at least 1".to_string()));
        }
        if self.max_concurrent_scopes == 0 {
            return Err(Error::Config("maxConcurrentScopes must be at least 1".to_string()));
        }
        if self.max_run_retries < 0 {
            return Err(Error::Config("maxRunRetries cannot be negative".to_string()));
        }
        Ok(())
    }

    pub fn job_lock_stale_after(&self) -> Duration {
        Duration::seconds(self.job_lock_stale_secs)
    }

    pub fn content_lock_stale_after(&self) -> Duration {
        Duration::seconds(self.content_lock_stale_secs)
    }

    pub fn fetch_retry_policy(&self) -> RetryPolicy {
        self.retry_policy(self.fetch_retry_attempts)
    }

    pub fn submission_retry_policy(&self) -> RetryPolicy {
        self.retry_policy(self.submission_retry_attempts)
    }

    pub fn persistence_retry_policy(&self) -> RetryPolicy {
        self.retry_policy(self.persistence_retry_attempts)
    }

    fn retry_policy(&self, attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            attempts,
            StdDuration::from_millis(self.retry_backoff_base_ms),
            StdDuration::from_secs(self.retry_backoff_cap_secs),
        )
        .with_jitter(StdDuration::from_millis(self.retry_jitter_ms))
    }
}

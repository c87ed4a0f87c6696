//! Scheduler configuration loading.
//!
//! Values come from `STOWAGE_*` environment variables; anything unset keeps
//! its default, anything malformed is an error rather than a silent fallback.

use std::time::Duration;

use stowage_jobs::{AdmissionConfig, RetryPolicy};

pub const ENV_RETRY_BASE_SECS: &str = "STOWAGE_RETRY_BASE_SECS";
pub const ENV_RETRY_MAX_SECS: &str = "STOWAGE_RETRY_MAX_SECS";
pub const ENV_MAX_RETRIES: &str = "STOWAGE_MAX_RETRIES";
pub const ENV_DEFAULT_JOB_MINUTES: &str = "STOWAGE_DEFAULT_JOB_MINUTES";
pub const ENV_FINISHED_HISTORY: &str = "STOWAGE_FINISHED_HISTORY";
pub const ENV_SWEEP_INTERVAL_MS: &str = "STOWAGE_SWEEP_INTERVAL_MS";

/// Default retry sweep poll interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a non-negative integer, got {value:?}")]
    Malformed { key: &'static str, value: String },
    #[error("{key} is out of range: {reason}")]
    OutOfRange { key: &'static str, reason: String },
}

/// Everything the job service and the retry sweeper need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub retry: RetryPolicy,
    pub admission: AdmissionConfig,
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            admission: AdmissionConfig::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl SchedulerConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let read = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(key) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ConfigError::Malformed { key, value: raw }),
            }
        };

        let base = read(ENV_RETRY_BASE_SECS)?
            .map(Duration::from_secs)
            .unwrap_or(defaults.retry.base_delay);
        let max = read(ENV_RETRY_MAX_SECS)?
            .map(Duration::from_secs)
            .unwrap_or(defaults.retry.max_delay);
        if base > max {
            return Err(ConfigError::OutOfRange {
                key: ENV_RETRY_BASE_SECS,
                reason: format!("base delay {}s exceeds max delay {}s", base.as_secs(), max.as_secs()),
            });
        }

        let max_retries = match read(ENV_MAX_RETRIES)? {
            Some(n) => u32::try_from(n).map_err(|_| ConfigError::OutOfRange {
                key: ENV_MAX_RETRIES,
                reason: format!("{n} does not fit in 32 bits"),
            })?,
            None => defaults.retry.max_retries,
        };

        let default_job_duration = match read(ENV_DEFAULT_JOB_MINUTES)? {
            Some(minutes) => {
                let secs = minutes.checked_mul(60).ok_or_else(|| ConfigError::OutOfRange {
                    key: ENV_DEFAULT_JOB_MINUTES,
                    reason: format!("{minutes} minutes overflows"),
                })?;
                Duration::from_secs(secs)
            }
            None => defaults.admission.default_job_duration,
        };

        let finished_history = match read(ENV_FINISHED_HISTORY)? {
            Some(n) => usize::try_from(n).map_err(|_| ConfigError::OutOfRange {
                key: ENV_FINISHED_HISTORY,
                reason: format!("{n} does not fit in usize"),
            })?,
            None => defaults.admission.finished_history,
        };

        let sweep_interval = match read(ENV_SWEEP_INTERVAL_MS)? {
            Some(0) => {
                return Err(ConfigError::OutOfRange {
                    key: ENV_SWEEP_INTERVAL_MS,
                    reason: "interval must be positive".to_string(),
                });
            }
            Some(ms) => Duration::from_millis(ms),
            None => defaults.sweep_interval,
        };

        Ok(Self {
            retry: RetryPolicy::exponential(max_retries, base, max),
            admission: AdmissionConfig::default()
                .with_default_job_duration(default_job_duration)
                .with_finished_history(finished_history),
            sweep_interval,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_admission(mut self, admission: AdmissionConfig) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

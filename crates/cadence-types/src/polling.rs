use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::run::PollStatus;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 80;
pub const DEFAULT_INITIAL_INTERVAL_MS: u64 = 75;
pub const DEFAULT_MAX_INTERVAL_MS: u64 = 500;
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.2;

/// Configuration for one polling attempt. Immutable once handed to the
/// poller; any field may be overridden per call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollingConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// When true, status fetches that fail also consume the attempt
    /// budget. Off by default: only successful status reads advance
    /// `attempts`, and a flaky transport is bounded by `timeout_ms`.
    #[serde(default)]
    pub count_failed_fetches: bool,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_interval_ms() -> u64 {
    DEFAULT_INITIAL_INTERVAL_MS
}

fn default_max_interval_ms() -> u64 {
    DEFAULT_MAX_INTERVAL_MS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_interval_ms: DEFAULT_INITIAL_INTERVAL_MS,
            max_interval_ms: DEFAULT_MAX_INTERVAL_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            count_failed_fetches: false,
        }
    }
}

impl PollingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be positive".to_string());
        }
        if self.initial_interval_ms == 0 || self.max_interval_ms == 0 {
            return Err("poll intervals must be positive".to_string());
        }
        if self.initial_interval_ms > self.max_interval_ms {
            return Err(format!(
                "initial_interval_ms ({}) must not exceed max_interval_ms ({})",
                self.initial_interval_ms, self.max_interval_ms
            ));
        }
        if self.timeout_ms == 0 {
            return Err("timeout_ms must be positive".to_string());
        }
        if self.backoff_factor <= 1.0 {
            return Err("backoff_factor must be greater than 1.0".to_string());
        }
        Ok(())
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Outcome of one orchestration attempt. Built once when the loop exits
/// and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingResult {
    /// True iff the terminal status observed was `completed`.
    pub success: bool,
    pub status: PollStatus,
    /// Number of status-fetch calls made.
    pub attempts: u32,
    /// Wall-clock elapsed from attempt start to outcome.
    pub total_time_ms: u64,
    pub error: Option<String>,
}

impl PollingResult {
    pub fn completed(attempts: u32, total_time_ms: u64) -> Self {
        Self {
            success: true,
            status: PollStatus::Run(crate::run::RunStatus::Completed),
            attempts,
            total_time_ms,
            error: None,
        }
    }

    pub fn failure(
        status: PollStatus,
        attempts: u32,
        total_time_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            status,
            attempts,
            total_time_ms,
            error: Some(error.into()),
        }
    }
}

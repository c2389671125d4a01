use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler limits and timer settings.
///
/// Every field has a compile-time default; a config file or the constructor
/// may override any of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleLimits {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Minimum gap between two job starts for one conversation. Zero disables it.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_attempts_per_hour")]
    pub max_attempts_per_hour: u32,
    /// Length of the trailing attempt window.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Drain retry when nothing in the queue is admissible, and the
    /// wait hint reported for a saturated slot table.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_drain_debounce_ms")]
    pub drain_debounce_ms: u64,
    /// Gap between consecutive promotions while the queue is non-empty.
    #[serde(default = "default_drain_stagger_ms")]
    pub drain_stagger_ms: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_min_interval_ms() -> u64 {
    3_000
}

fn default_max_attempts_per_hour() -> u32 {
    30
}

fn default_window_seconds() -> u64 {
    3_600
}

fn default_retry_backoff_ms() -> u64 {
    5_000
}

fn default_drain_debounce_ms() -> u64 {
    100
}

fn default_drain_stagger_ms() -> u64 {
    1_000
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

impl Default for ThrottleLimits {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            min_interval_ms: default_min_interval_ms(),
            max_attempts_per_hour: default_max_attempts_per_hour(),
            window_seconds: default_window_seconds(),
            retry_backoff_ms: default_retry_backoff_ms(),
            drain_debounce_ms: default_drain_debounce_ms(),
            drain_stagger_ms: default_drain_stagger_ms(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl ThrottleLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_concurrent must be > 0".to_string(),
            ));
        }
        if self.max_attempts_per_hour == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_attempts_per_hour must be > 0".to_string(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(SchedulerError::InvalidConfig(
                "window_seconds must be > 0".to_string(),
            ));
        }
        if self.retry_backoff_ms == 0 {
            return Err(SchedulerError::InvalidConfig(
                "retry_backoff_ms must be > 0".to_string(),
            ));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(SchedulerError::InvalidConfig(
                "sweep_interval_seconds must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn drain_debounce(&self) -> Duration {
        Duration::from_millis(self.drain_debounce_ms)
    }

    pub fn drain_stagger(&self) -> Duration {
        Duration::from_millis(self.drain_stagger_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

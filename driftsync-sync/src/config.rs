//! Engine configuration.
//!
//! All durations are stored as milliseconds so a config can be loaded from
//! JSON written by the host app. Missing fields take their defaults.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Floor applied to the registry poll interval while the quota guard is on.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Retry and batching policy for the sync queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts after which a failing task is parked as `failed`.
    pub max_attempts: u32,
    /// Backoff grows linearly: `base * attempts`.
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay.
    pub backoff_cap_ms: u64,
    /// Tasks taken per processing pass.
    pub batch_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 300_000,
            batch_limit: 50,
        }
    }
}

impl QueueConfig {
    /// Delay before the next try of a task that has failed `attempts` times.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let delay = self
            .backoff_base_ms
            .saturating_mul(u64::from(attempts))
            .min(self.backoff_cap_ms);
        Duration::from_millis(delay)
    }
}

/// Timers used by registry listeners unless overridden per listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerDefaults {
    /// One-shot reconciliation after subscribe.
    pub initial_reconcile_delay_ms: u64,
    /// Interval of the gated periodic reconciliation.
    pub periodic_reconcile_ms: u64,
    /// Poll interval while the quota guard has live listeners detached.
    pub poll_interval_ms: u64,
}

impl Default for ListenerDefaults {
    fn default() -> Self {
        Self {
            initial_reconcile_delay_ms: 5_000,
            periodic_reconcile_ms: 5 * 60 * 1_000,
            poll_interval_ms: 30_000,
        }
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub queue: QueueConfig,
    pub listener: ListenerDefaults,
    /// Quiet period before the background push after a local write.
    pub push_debounce_ms: u64,
    /// Minimum spacing of gated pulls.
    pub pull_cooldown_ms: u64,
    /// How long a quota-class failure disables remote work.
    pub quota_disable_ms: u64,
    /// Records per chunk for bulk local operations.
    pub chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            listener: ListenerDefaults::default(),
            push_debounce_ms: 250,
            pull_cooldown_ms: 60_000,
            quota_disable_ms: 60 * 60 * 1_000,
            chunk_size: 500,
        }
    }
}

impl SyncConfig {
    /// Parses a config from JSON; absent fields keep their defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.chunk_size == 0 {
            return Err(SyncError::Validation("chunk_size must be positive".into()));
        }
        if self.queue.batch_limit == 0 {
            return Err(SyncError::Validation("batch_limit must be positive".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(SyncError::Validation("max_attempts must be positive".into()));
        }
        Ok(())
    }

    pub fn push_debounce(&self) -> Duration {
        Duration::from_millis(self.push_debounce_ms)
    }

    pub fn pull_cooldown(&self) -> Duration {
        Duration::from_millis(self.pull_cooldown_ms)
    }

    pub fn quota_disable_window(&self) -> Duration {
        Duration::from_millis(self.quota_disable_ms)
    }
}

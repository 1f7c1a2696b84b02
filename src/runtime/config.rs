use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine tunables.
///
/// Missing fields fall back to the defaults when loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Failed attempts after which a mutation fails terminally.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles per further failure.
    pub backoff_base_ms: u64,
    /// Upper bound of the retry delay.
    pub backoff_cap_ms: u64,
    /// How long a mutation may stay in flight before the reaper fails it.
    pub stale_after_ms: u64,
    /// Wait before reopening a failed push subscription.
    pub resubscribe_delay_ms: u64,
    /// Per-request timeout of remote writes.
    pub request_timeout_ms: u64,
    /// Period of the background reaper.
    pub reap_interval_ms: u64,
    /// How long failed mutations are kept for manual retry.
    pub failed_retention_ms: u64,
    /// Mutations of one collection sent at once.
    pub max_concurrent_sends: usize,
    /// Buffer of the event channel; slow subscribers lag past it.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            stale_after_ms: 300_000,
            resubscribe_delay_ms: 5_000,
            request_timeout_ms: 30_000,
            reap_interval_ms: 60_000,
            failed_retention_ms: 86_400_000,
            max_concurrent_sends: 4,
            event_capacity: 1_024,
        }
    }
}

impl SyncConfig {
    /// Parses camelCase JSON; absent keys keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Delay before the next attempt after `failures` failed attempts.
    pub fn backoff_delay_ms(&self, failures: u32) -> u64 {
        let exp = failures.saturating_sub(1).min(32);
        self.backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap_ms)
    }

    /// [`SyncConfig::request_timeout_ms`] as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// [`SyncConfig::resubscribe_delay_ms`] as a duration.
    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    /// [`SyncConfig::reap_interval_ms`] as a duration, at least 1 ms.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }
}

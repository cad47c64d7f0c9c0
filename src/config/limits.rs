//! Resource limits for accounts and sourcing consumers.

use std::time::Duration;

use serde::Deserialize;

/// Default number of upstream messages fetched per catch-up batch.
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Default capacity of a stream's live append notification channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default first retry delay when an upstream is unreachable.
pub const DEFAULT_MIN_BACKOFF_MS: u64 = 50;

/// Default retry delay cap when an upstream is unreachable.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 2_000;

/// Per-account limits. `-1` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AccountLimits {
    /// Maximum streams the account may own.
    pub max_streams: i64,
    /// Maximum source bindings the account's streams may hold.
    pub max_consumers: i64,
    /// Cap applied to every stream's `max_bytes`.
    pub max_bytes: i64,
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl AccountLimits {
    pub fn unlimited() -> Self {
        Self {
            max_streams: -1,
            max_consumers: -1,
            max_bytes: -1,
        }
    }
}

/// Tuning for sourcing consumers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SourcingConfig {
    /// Upstream messages fetched per catch-up batch.
    ///
    /// Default: 256.
    pub batch_size: usize,

    /// Live append notification channel capacity per stream.
    ///
    /// Default: 1,024. A consumer that falls further behind than this
    /// drops back to catching up.
    pub channel_capacity: usize,

    /// First retry delay after the upstream became unreachable.
    pub min_backoff_ms: u64,

    /// Retry delay cap while the upstream stays unreachable.
    pub max_backoff_ms: u64,
}

impl Default for SourcingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            min_backoff_ms: DEFAULT_MIN_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl SourcingConfig {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

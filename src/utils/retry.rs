//! Retry utilities: backoff builders for sourcing consumers.
//!
//! Uses `backon` for exponential backoff with jitter. Consumers build a
//! fresh iterator whenever the upstream becomes reachable again.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::SourcingConfig;

/// Backoff while an upstream is unreachable.
///
/// - Min delay: `sourcing.min_backoff_ms`
/// - Max delay: `sourcing.max_backoff_ms`
/// - Jitter enabled
///
/// Callers fall back to the max delay once the iterator is exhausted, so
/// recovery never gives up.
pub fn sourcing_backoff(config: &SourcingConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(config.min_backoff())
        .with_max_delay(config.max_backoff())
        .with_max_times(32)
        .with_jitter()
}

/// Backoff for cursor store reads and writes.
///
/// - Min delay: 10ms
/// - Max delay: 500ms
/// - Max attempts: 5
/// - Jitter enabled
pub fn cursor_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(5)
        .with_jitter()
}

//! Retry budget and backoff calculation for resilient fetches.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SyncError;

/// Retry/backoff tunables for a resilient load.
///
/// Each candidate gets `1 + max_retries_per_candidate` attempts. Retries of
/// the same candidate wait `min(base_delay * 2^retry, max_delay)`; failing
/// over to the next candidate is immediate.
///
/// ```rust
/// # use repsync::FetchConfig;
/// # use std::time::Duration;
/// let config = FetchConfig::new()
///     .max_retries_per_candidate(2)
///     .base_delay(Duration::from_millis(100));
/// assert_eq!(config.delay_for_retry(0), Duration::from_millis(100));
/// assert_eq!(config.delay_for_retry(1), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Retries per candidate after its first attempt. Default: 2.
    pub max_retries_per_candidate: u32,
    /// Delay before the first retry. Default: 500ms.
    #[serde(rename = "base_delay_ms", with = "crate::config::millis")]
    pub base_delay: Duration,
    /// Cap on exponential growth. Default: 8s.
    #[serde(rename = "max_delay_ms", with = "crate::config::millis")]
    pub max_delay: Duration,
    /// Per-attempt deadline; an attempt that exceeds it fails with
    /// [`SyncError::Timeout`]. Default: 30s.
    #[serde(
        rename = "attempt_timeout_ms",
        with = "crate::config::millis_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub attempt_timeout: Option<Duration>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries_per_candidate: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl FetchConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable retries: every candidate is tried exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_retries_per_candidate: 0,
            ..Self::default()
        }
    }

    pub fn max_retries_per_candidate(mut self, n: u32) -> Self {
        self.max_retries_per_candidate = n;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Backoff before retry number `retry` (0-indexed) of the same candidate.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(retry));
        delay.min(self.max_delay)
    }

    /// Worst-case total backoff for `candidates` sources that all fail.
    pub fn worst_case_backoff(&self, candidates: usize) -> Duration {
        let per_candidate: Duration = (0..self.max_retries_per_candidate)
            .map(|r| self.delay_for_retry(r))
            .sum();
        per_candidate.saturating_mul(u32::try_from(candidates).unwrap_or(u32::MAX))
    }
}

/// What to do after an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    /// Wait, then retry the same candidate.
    Retry(Duration),
    /// Move on to the next candidate immediately.
    Failover,
    /// Stop the whole session.
    Abort,
}

/// Decide the next step after `error` on retry number `retry`.
///
/// Terminal errors (credential or payload rejected) stop the session,
/// `NotFound` and other non-transient errors skip straight to the next
/// candidate, transient errors retry while the budget lasts.
pub(crate) fn next_step(config: &FetchConfig, error: &SyncError, retry: u32) -> Next {
    if error.is_terminal() {
        Next::Abort
    } else if error.is_transient() && retry < config.max_retries_per_candidate {
        Next::Retry(config.delay_for_retry(retry))
    } else {
        Next::Failover
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let config = FetchConfig::new()
            .base_delay(Duration::from_millis(300))
            .max_delay(Duration::from_millis(1000));
        assert_eq!(config.delay_for_retry(0), Duration::from_millis(300));
        assert_eq!(config.delay_for_retry(1), Duration::from_millis(600));
        assert_eq!(config.delay_for_retry(2), Duration::from_millis(1000));
        assert_eq!(config.delay_for_retry(40), Duration::from_millis(1000));
    }

    #[test]
    fn worst_case_backoff_sums_per_candidate() {
        let config = FetchConfig::new()
            .max_retries_per_candidate(2)
            .base_delay(Duration::from_millis(100));
        assert_eq!(config.worst_case_backoff(2), Duration::from_millis(600));
    }

    #[test]
    fn step_classification() {
        let config = FetchConfig::new().max_retries_per_candidate(1);
        assert_eq!(
            next_step(&config, &SyncError::Timeout, 0),
            Next::Retry(config.delay_for_retry(0))
        );
        assert_eq!(next_step(&config, &SyncError::Timeout, 1), Next::Failover);
        assert_eq!(
            next_step(&config, &SyncError::NotFound("x".into()), 0),
            Next::Failover
        );
        assert_eq!(next_step(&config, &SyncError::Unauthorized, 0), Next::Abort);
    }
}

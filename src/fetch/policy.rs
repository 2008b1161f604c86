use std::time::Duration;

use super::source::FetchError;
use crate::config::RetryConfig;

/// Internal decision for how to proceed after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Retry { delay: Duration },
    RefreshCredentials,
    Fail,
}

/// Retry rules for one fetch.
///
/// Keep this deterministic and explainable: the decision depends only on the
/// error, the number of calls made so far, and whether credentials were
/// already refreshed.
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_inline_wait: Duration,
}

impl RetryPolicy {
    pub fn new(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            min_delay_ms: cfg.min_delay_ms,
            max_delay_ms: cfg.max_delay_ms.max(cfg.min_delay_ms),
            max_inline_wait: cfg.max_inline_wait(),
        }
    }

    /// Exponential backoff: min_delay * 2^(attempt-1), capped at max_delay.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let delay = self.min_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Wait after a throttled attempt: the upstream's suggestion, else backoff.
    pub fn throttle_wait(&self, retry_after: Option<Duration>, attempt: u32) -> Duration {
        retry_after.unwrap_or_else(|| self.backoff_delay(attempt))
    }

    /// Decide what to do after the `attempt`-th call (1-based) failed.
    pub fn decide(
        &self,
        err: &FetchError,
        attempt: u32,
        can_refresh: bool,
        refreshed: bool,
    ) -> Decision {
        let attempts_left = attempt < self.max_attempts;
        match err {
            FetchError::Unauthorized(_) => {
                if can_refresh && !refreshed && attempts_left {
                    Decision::RefreshCredentials
                } else {
                    Decision::Fail
                }
            }
            FetchError::Throttled { retry_after } => {
                let wait = self.throttle_wait(*retry_after, attempt);
                if attempts_left && wait <= self.max_inline_wait {
                    Decision::Retry { delay: wait }
                } else {
                    Decision::Fail
                }
            }
            FetchError::Transport(_) => {
                if attempts_left {
                    Decision::Retry {
                        delay: self.backoff_delay(attempt),
                    }
                } else {
                    Decision::Fail
                }
            }
            FetchError::Status { .. } => Decision::Fail,
        }
    }
}

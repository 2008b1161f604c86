//! Rate-gated retry loop around fetcher calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::{Decision, RetryPolicy};
use super::source::{CredentialRefresher, FetchError, Fetcher, PageParams};
use crate::config::{PagingConfig, RetryConfig};
use crate::resilience::rate_limiter::{RateDecision, RateLimiter};
use crate::types::{EnrichedFields, RawRecord};
use crate::{Error, Result};

pub struct RetryingClient {
    limiter: Arc<RateLimiter>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    paging: PagingConfig,
    cancel: CancellationToken,
}

impl RetryingClient {
    pub fn new(limiter: Arc<RateLimiter>, retry: &RetryConfig, cancel: CancellationToken) -> Self {
        Self {
            limiter,
            refresher: None,
            policy: RetryPolicy::new(retry),
            attempt_timeout: retry.attempt_timeout(),
            paging: PagingConfig::default(),
            cancel,
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_paging(mut self, paging: PagingConfig) -> Self {
        self.paging = paging;
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `call` until it succeeds, the retry budget is spent, or the limiter says no.
    ///
    /// A limiter denial fails fast and does not count as an attempt.
    pub async fn fetch<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, FetchError>>,
    {
        let mut attempts: u32 = 0;
        let mut refreshed = false;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled(format!(
                    "{} cancelled before attempt {}",
                    op,
                    attempts + 1
                )));
            }

            if let RateDecision::Denied {
                reason,
                retry_after,
            } = self.limiter.try_acquire().await
            {
                debug!(op, reason = reason.as_str(), "fetch denied by rate limiter");
                return Err(Error::RateLimited {
                    reason,
                    retry_after: Some(retry_after),
                });
            }

            attempts += 1;
            let outcome = match tokio::time::timeout(self.attempt_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Transport(format!(
                    "attempt timed out after {}s",
                    self.attempt_timeout.as_secs()
                ))),
            };

            let err = match outcome {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(op, attempts, "fetch succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if let FetchError::Throttled { retry_after } = &err {
                let wait = self.policy.throttle_wait(*retry_after, attempts);
                self.limiter.record_external_backoff(wait).await;
            }

            match self
                .policy
                .decide(&err, attempts, self.refresher.is_some(), refreshed)
            {
                Decision::RefreshCredentials => {
                    refreshed = true;
                    if let Some(refresher) = &self.refresher {
                        info!(op, attempt = attempts, "credentials rejected, refreshing");
                        refresher.refresh().await.map_err(|e| Error::AuthFailed {
                            message: format!("credential refresh failed: {}", e),
                        })?;
                    }
                }
                Decision::Retry { delay } => {
                    warn!(
                        op,
                        attempt = attempts,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "fetch attempt failed, retrying"
                    );
                    self.sleep_or_cancel(op, delay).await?;
                }
                Decision::Fail => {
                    warn!(op, attempts, error = %err, "fetch failed");
                    return Err(Error::from_fetch(err, attempts));
                }
            }
        }
    }

    async fn sleep_or_cancel(&self, op: &str, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled(format!("{} cancelled during backoff", op))),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    pub async fn fetch_batch(&self, fetcher: &dyn Fetcher, params: &PageParams) -> Result<Vec<RawRecord>> {
        self.fetch("fetch_batch", move || fetcher.fetch_batch(params))
            .await
    }

    /// Walk pages until a short page or the configured page limit.
    pub async fn fetch_all_pages(&self, fetcher: &dyn Fetcher) -> Result<Vec<RawRecord>> {
        let mut params = PageParams::first(self.paging.per_page);
        let mut all = Vec::new();
        loop {
            let batch = self.fetch_batch(fetcher, &params).await?;
            let count = batch.len();
            all.extend(batch);
            debug!(
                fetcher = fetcher.name(),
                page = params.page,
                count,
                "fetched page"
            );
            if count < params.per_page as usize || params.page >= self.paging.max_pages {
                break;
            }
            params = params.next();
        }
        Ok(all)
    }

    pub async fn fetch_enrichment(&self, fetcher: &dyn Fetcher, id: &str) -> Result<EnrichedFields> {
        self.fetch("fetch_enrichment", move || fetcher.fetch_enrichment(id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::config::RateLimitConfig;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn client(limits: RateLimitConfig) -> RetryingClient {
        let limiter = Arc::new(RateLimiter::new(&limits, system_clock()));
        let retry = RetryConfig::default()
            .with_max_attempts(3)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5));
        RetryingClient::new(limiter, &retry, CancellationToken::new())
    }

    fn scripted(
        script: Vec<std::result::Result<u32, FetchError>>,
    ) -> (Arc<Mutex<VecDeque<std::result::Result<u32, FetchError>>>>, Arc<AtomicU32>) {
        (
            Arc::new(Mutex::new(script.into_iter().collect())),
            Arc::new(AtomicU32::new(0)),
        )
    }

    struct CountingRefresher(AtomicU32);

    #[async_trait]
    impl CredentialRefresher for CountingRefresher {
        async fn refresh(&self) -> std::result::Result<(), FetchError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn run(
        client: &RetryingClient,
        script: Arc<Mutex<VecDeque<std::result::Result<u32, FetchError>>>>,
        calls: Arc<AtomicU32>,
    ) -> Result<u32> {
        client
            .fetch("test", || {
                let script = script.clone();
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    script
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or(Err(FetchError::Transport("script exhausted".into())))
                }
            })
            .await
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let c = client(RateLimitConfig::new());
        let (script, calls) = scripted(vec![
            Err(FetchError::Transport("reset".into())),
            Err(FetchError::Transport("reset".into())),
            Ok(7),
        ]);
        assert_eq!(run(&c, script, calls.clone()).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_transport() {
        let c = client(RateLimitConfig::new());
        let (script, calls) = scripted(vec![]);
        let err = run(&c, script, calls.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Transport { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_denied_by_limiter_without_calling() {
        let c = client(RateLimitConfig::new().with_window("tiny", 1, Duration::from_secs(60)));
        let (script, calls) = scripted(vec![Err(FetchError::Transport("reset".into()))]);
        let err = run(&c, script, calls.clone()).await.unwrap_err();
        // First call consumed the only slot; the retry is denied.
        assert!(matches!(err, Error::RateLimited { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_credentials_once() {
        let refresher = Arc::new(CountingRefresher(AtomicU32::new(0)));
        let c = client(RateLimitConfig::new()).with_refresher(refresher.clone());

        let (script, calls) = scripted(vec![Err(FetchError::Unauthorized("expired".into())), Ok(1)]);
        assert_eq!(run(&c, script, calls).await.unwrap(), 1);
        assert_eq!(refresher.0.load(Ordering::SeqCst), 1);

        let (script, calls) = scripted(vec![
            Err(FetchError::Unauthorized("expired".into())),
            Err(FetchError::Unauthorized("revoked".into())),
        ]);
        let err = run(&c, script, calls.clone()).await.unwrap_err();
        assert!(matches!(err, Error::AuthFailed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refresher.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_throttle_records_backoff_and_retries() {
        let c = client(RateLimitConfig::new());
        let (script, calls) = scripted(vec![
            Err(FetchError::Throttled {
                retry_after: Some(Duration::from_millis(20)),
            }),
            Ok(3),
        ]);
        assert_eq!(run(&c, script, calls.clone()).await.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_throttle_without_retry_after_records_backoff() {
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::new(), system_clock()));
        let retry = RetryConfig::default()
            .with_max_attempts(1)
            .with_delays(Duration::from_secs(30), Duration::from_secs(60));
        let c = RetryingClient::new(limiter, &retry, CancellationToken::new());
        let (script, calls) = scripted(vec![Err(FetchError::Throttled { retry_after: None })]);

        let err = run(&c, script, calls.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Throttled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let backoff = c.limiter().snapshot().await.backoff_remaining.unwrap();
        assert!(backoff > Duration::from_secs(25));
        assert!(!c.limiter().try_acquire().await.is_allowed());
    }

    #[tokio::test]
    async fn test_long_throttle_fails_fast() {
        let c = client(RateLimitConfig::new());
        let (script, calls) = scripted(vec![Err(FetchError::Throttled {
            retry_after: Some(Duration::from_secs(900)),
        })]);
        let err = run(&c, script, calls.clone()).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(900)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(c.limiter().snapshot().await.backoff_remaining.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_client_makes_no_calls() {
        let c = client(RateLimitConfig::new());
        c.cancellation().cancel();
        let (script, calls) = scripted(vec![Ok(1)]);
        assert!(matches!(run(&c, script, calls.clone()).await, Err(Error::Cancelled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

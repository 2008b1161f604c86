use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::core::{missing_fetcher, CacheEngine};
use crate::clock::{system_clock, SharedClock};
use crate::config::EngineConfig;
use crate::fetch::{CredentialRefresher, Fetcher, RetryingClient};
use crate::resilience::rate_limiter::RateLimiter;
use crate::scheduler::SchedulerSignals;
use crate::store::{CacheStore, FileBackend, SnapshotBackend};
use crate::Result;

/// Builder for [`CacheEngine`].
///
/// Only the fetcher is mandatory. Storage defaults to files under
/// `config.store.dir`, time to the system clock.
pub struct CacheEngineBuilder {
    config: EngineConfig,
    fetcher: Option<Arc<dyn Fetcher>>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    backend: Option<Arc<dyn SnapshotBackend>>,
    clock: SharedClock,
    cancel: CancellationToken,
}

impl CacheEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            fetcher: None,
            refresher: None,
            backend: None,
            clock: system_clock(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Called once when the upstream rejects credentials.
    pub fn credential_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn SnapshotBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Use an externally owned token, e.g. a child of the application's shutdown token.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn build(self) -> Result<CacheEngine> {
        self.config.validate()?;
        let fetcher = self.fetcher.ok_or_else(missing_fetcher)?;
        let backend: Arc<dyn SnapshotBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(FileBackend::new(self.config.store.dir.clone())),
        };

        let store = Arc::new(CacheStore::open(
            self.config.cache_type.clone(),
            &self.config.store,
            backend,
            self.clock.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(&self.config.rate_limit, self.clock.clone()));
        let mut client = RetryingClient::new(limiter.clone(), &self.config.retry, self.cancel)
            .with_paging(self.config.paging.clone());
        if let Some(refresher) = self.refresher {
            client = client.with_refresher(refresher);
        }

        info!(
            cache_type = self.config.cache_type.as_str(),
            fetcher = fetcher.name(),
            windows = self.config.rate_limit.windows.len(),
            retention = ?self.config.retention,
            "cache engine built"
        );

        Ok(CacheEngine {
            signals: Arc::new(SchedulerSignals::new()),
            store,
            limiter,
            client,
            fetcher,
            clock: self.clock,
            last_refresh: Mutex::new(None),
            last_error: Mutex::new(None),
            config: self.config,
        })
    }
}

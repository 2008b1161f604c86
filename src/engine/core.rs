use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::stats::{EngineStats, RefreshSummary};
use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::enrichment::{reconcile, SweepStop};
use crate::fetch::{Fetcher, RetryingClient};
use crate::merge::{merge, normalize_batch};
use crate::resilience::rate_limiter::RateLimiter;
use crate::scheduler::{RefreshScheduler, SchedulerHandle, SchedulerSignals, SchedulerState};
use crate::store::CacheStore;
use crate::types::{CacheSnapshot, Record};
use crate::{Error, ErrorContext, Result};

/// What started a refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// Periodic tick found the snapshot stale or never populated.
    Scheduled,
    Forced,
    /// The store could not recover any valid snapshot.
    Emergency,
}

impl RefreshTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshTrigger::Scheduled => "scheduled",
            RefreshTrigger::Forced => "forced",
            RefreshTrigger::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Completed(RefreshSummary),
    /// Another cycle held the refresh lock; nothing was done.
    AlreadyInProgress,
}

/// One cache instance: store, rate budget, retrying client and fetcher.
pub struct CacheEngine {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<CacheStore>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) client: RetryingClient,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) clock: SharedClock,
    pub(crate) signals: Arc<SchedulerSignals>,
    pub(crate) last_refresh: Mutex<Option<RefreshSummary>>,
    pub(crate) last_error: Mutex<Option<String>>,
}

impl CacheEngine {
    pub fn cache_type(&self) -> &str {
        &self.config.cache_type
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Token shared by the client and the scheduler. Cancelling it is terminal.
    pub fn cancellation(&self) -> &CancellationToken {
        self.client.cancellation()
    }

    /// Spawn the background refresh loop for this engine.
    pub fn start(self: &Arc<Self>) -> Result<SchedulerHandle> {
        RefreshScheduler::new(self.clone()).spawn()
    }

    /// Ask the running scheduler for an immediate refresh.
    ///
    /// Returns `false` when no scheduler is running, a refresh is already in
    /// progress, or the scheduler is cooling down.
    pub fn force_refresh(&self) -> bool {
        self.signals.request_refresh()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.signals.state()
    }

    /// First `limit` records of the current snapshot, in source order.
    ///
    /// Never fails: a storage problem degrades to whatever is in memory, or nothing.
    pub async fn get_snapshot(&self, limit: Option<usize>) -> Vec<Record> {
        if let Some(snapshot) = self.store.current() {
            return snapshot.head(limit);
        }
        match self.store.load().await {
            Ok(outcome) => outcome.snapshot.head(limit),
            Err(e) => {
                warn!(cache_type = self.cache_type(), error = %e, "snapshot unavailable for readers");
                Vec::new()
            }
        }
    }

    /// Run one load → fetch → merge → enrich → save cycle.
    pub async fn refresh_once(&self, trigger: RefreshTrigger) -> Result<RefreshOutcome> {
        let Some(_guard) = self.store.try_lock_refresh() else {
            debug!(cache_type = self.cache_type(), trigger = trigger.as_str(), "refresh already in progress");
            return Ok(RefreshOutcome::AlreadyInProgress);
        };

        let refresh_id = Uuid::new_v4();
        let span = info_span!(
            "refresh",
            cache_type = self.cache_type(),
            refresh_id = %refresh_id,
            trigger = trigger.as_str()
        );
        let result = self.run_cycle(refresh_id, trigger).instrument(span).await;

        match &result {
            Ok(summary) => {
                self.set_last_error(None);
                if let Ok(mut last) = self.last_refresh.lock() {
                    *last = Some(summary.clone());
                }
            }
            Err(e) => self.set_last_error(Some(e.to_string())),
        }
        result.map(RefreshOutcome::Completed)
    }

    async fn run_cycle(&self, refresh_id: Uuid, trigger: RefreshTrigger) -> Result<RefreshSummary> {
        let started_at = self.clock.now();
        info!("refresh started");

        let loaded = self.store.load().await?;
        let base = match (loaded.emergency_refresh, self.store.current()) {
            (true, Some(in_memory)) => {
                warn!(
                    records = in_memory.len(),
                    "stored snapshot unrecoverable, merging against last in-memory snapshot"
                );
                in_memory
            }
            (true, None) => {
                warn!("cached snapshot unrecoverable, rebuilding from source");
                loaded.snapshot
            }
            (false, _) => loaded.snapshot,
        };

        let raw = self.client.fetch_all_pages(self.fetcher.as_ref()).await?;
        let fetched = raw.len();
        let batch = normalize_batch(raw, &self.config.filter);
        let rejected = batch.rejected.len();

        let mut merged = merge(&base.records, batch.records, self.config.retention);
        info!(
            fetched,
            rejected,
            added = merged.added,
            updated = merged.updated,
            unchanged = merged.unchanged,
            dropped = merged.dropped,
            "merged fresh batch"
        );

        let sweep = reconcile(
            &mut merged.records,
            &self.client,
            self.fetcher.as_ref(),
            &self.config.enrichment,
            self.clock.as_ref(),
        )
        .await;
        if sweep.stop == SweepStop::Cancelled {
            info!("enrichment interrupted, saving partial progress");
        }

        let finished_at = self.clock.now();
        let snapshot = CacheSnapshot {
            generated_at: Some(finished_at),
            last_enrichment_sweep_at: Some(finished_at),
            records: merged.records,
        };
        let record_count = snapshot.len();
        self.store.save(snapshot).await?;

        info!(records = record_count, "refresh completed");
        Ok(RefreshSummary {
            refresh_id,
            trigger,
            started_at,
            finished_at,
            fetched,
            rejected,
            added: merged.added,
            updated: merged.updated,
            unchanged: merged.unchanged,
            dropped: merged.dropped,
            record_count,
            sweep,
        })
    }

    fn set_last_error(&self, error: Option<String>) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = error;
        }
    }

    pub async fn stats(&self) -> EngineStats {
        let limiter = self.limiter.snapshot().await;
        let primary = limiter.primary().cloned();
        let snapshot = self.store.current();
        let last_refresh_at: Option<DateTime<Utc>> = snapshot.as_ref().and_then(|s| s.generated_at);

        EngineStats {
            cache_type: self.config.cache_type.clone(),
            calls_this_window: primary.as_ref().map(|w| w.calls_made).unwrap_or(0),
            ceiling: primary.as_ref().map(|w| w.ceiling).unwrap_or(0),
            remaining: primary.as_ref().map(|w| w.remaining).unwrap_or(0),
            backoff_remaining: limiter.backoff_remaining,
            last_refresh_at,
            last_enrichment_sweep_at: snapshot.as_ref().and_then(|s| s.last_enrichment_sweep_at),
            record_count: snapshot.as_ref().map(|s| s.len()).unwrap_or(0),
            state: self.signals.state(),
            refreshing: self.store.is_refresh_locked(),
            last_refresh: self.last_refresh.lock().ok().and_then(|l| l.clone()),
            last_error: self.last_error.lock().ok().and_then(|l| l.clone()),
            windows: limiter.windows,
        }
    }

    /// Stop background work and close the store.
    pub fn close(&self) {
        self.cancellation().cancel();
        self.store.close();
    }
}

pub(crate) fn missing_fetcher() -> Error {
    Error::configuration_with_context(
        "a fetcher is required",
        ErrorContext::new().with_source("cache_engine_builder"),
    )
}

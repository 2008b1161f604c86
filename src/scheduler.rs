//! 调度模块：后台刷新循环，按过期时间、强制请求或紧急信号触发刷新。
//!
//! # Refresh Scheduler
//!
//! A single tokio task per engine, moving between three states:
//!
//! - **Idle**: waits for the next tick, a forced refresh, or shutdown. On every
//!   wake-up (and once immediately on start) it refreshes if the snapshot is
//!   stale, was never populated, or the store asked for an emergency rebuild.
//! - **Refreshing**: one cycle is running; further triggers are rejected.
//! - **Cooldown**: the upstream budget is exhausted; nothing runs until the
//!   suggested backoff has elapsed.
//!
//! Failures other than rate limiting go straight back to Idle and are retried
//! on the next tick.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{elapsed_between, to_chrono};
use crate::engine::{CacheEngine, RefreshOutcome, RefreshTrigger};
use crate::{Error, ErrorClass, ErrorContext, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Refreshing,
    Cooldown { until: DateTime<Utc> },
}

/// State and trigger shared between an engine and its scheduler task.
pub struct SchedulerSignals {
    state: watch::Sender<SchedulerState>,
    force: Notify,
    force_pending: AtomicBool,
    running: AtomicBool,
}

impl SchedulerSignals {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            state,
            force: Notify::new(),
            force_pending: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SchedulerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "scheduler state changed");
        }
    }

    /// Accepted only while a scheduler is running and idle, once per wake-up.
    pub(crate) fn request_refresh(&self) -> bool {
        if !self.is_running() || self.state() != SchedulerState::Idle {
            return false;
        }
        if self.force_pending.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.force.notify_one();
        true
    }

    fn take_force(&self) -> bool {
        self.force_pending.swap(false, Ordering::SeqCst)
    }
}

pub struct RefreshScheduler {
    engine: Arc<CacheEngine>,
    tick: Duration,
    refresh_interval: Duration,
    default_backoff: Duration,
    grace: Duration,
}

impl RefreshScheduler {
    pub fn new(engine: Arc<CacheEngine>) -> Self {
        let config = engine.config();
        Self {
            tick: config.scheduler.tick_interval(),
            refresh_interval: config.scheduler.refresh_interval(),
            default_backoff: config.rate_limit.default_backoff(),
            grace: config.scheduler.shutdown_grace(),
            engine,
        }
    }

    pub fn spawn(self) -> Result<SchedulerHandle> {
        let signals = self.engine.signals.clone();
        if signals.running.swap(true, Ordering::SeqCst) {
            return Err(Error::configuration_with_context(
                "scheduler already running",
                ErrorContext::new()
                    .with_field_path(self.engine.cache_type().to_string())
                    .with_source("refresh_scheduler"),
            ));
        }
        let cancel = self.engine.cancellation().clone();
        let grace = self.grace;
        let join = tokio::spawn(self.run());
        Ok(SchedulerHandle {
            signals,
            cancel,
            grace,
            join: Some(join),
        })
    }

    async fn run(self) {
        let signals = self.engine.signals.clone();
        let cancel = self.engine.cancellation().clone();
        info!(
            cache_type = self.engine.cache_type(),
            tick_secs = self.tick.as_secs(),
            refresh_interval_secs = self.refresh_interval.as_secs(),
            "refresh scheduler started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let wait = match signals.state() {
                SchedulerState::Cooldown { until } if until > self.engine.clock().now() => {
                    // Forced requests are meaningless while the budget is exhausted.
                    signals.take_force();
                    elapsed_between(self.engine.clock().now(), until).min(self.tick)
                }
                state => {
                    if let SchedulerState::Cooldown { .. } = state {
                        info!(cache_type = self.engine.cache_type(), "cooldown elapsed");
                        signals.set_state(SchedulerState::Idle);
                    }
                    let forced = signals.take_force();
                    if let Some(trigger) = self.due(forced).await {
                        self.run_cycle(trigger).await;
                    }
                    match signals.state() {
                        SchedulerState::Cooldown { until } => {
                            elapsed_between(self.engine.clock().now(), until).min(self.tick)
                        }
                        _ => self.tick,
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = signals.force.notified() => {
                    debug!(cache_type = self.engine.cache_type(), "forced refresh requested");
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        signals.set_state(SchedulerState::Idle);
        signals.running.store(false, Ordering::SeqCst);
        info!(cache_type = self.engine.cache_type(), "refresh scheduler stopped");
    }

    /// Decide whether this wake-up should refresh, and why.
    async fn due(&self, forced: bool) -> Option<RefreshTrigger> {
        if forced {
            return Some(RefreshTrigger::Forced);
        }
        let outcome = match self.engine.store().load().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(cache_type = self.engine.cache_type(), error = %e, "cannot inspect snapshot");
                return None;
            }
        };
        if outcome.emergency_refresh {
            return Some(RefreshTrigger::Emergency);
        }
        match outcome.snapshot.generated_at {
            None => Some(RefreshTrigger::Scheduled),
            Some(at) if elapsed_between(at, self.engine.clock().now()) >= self.refresh_interval => {
                Some(RefreshTrigger::Scheduled)
            }
            Some(_) => None,
        }
    }

    async fn run_cycle(&self, trigger: RefreshTrigger) {
        let signals = &self.engine.signals;
        signals.set_state(SchedulerState::Refreshing);

        let next = match self.engine.refresh_once(trigger).await {
            Ok(RefreshOutcome::Completed(summary)) => {
                info!(
                    cache_type = self.engine.cache_type(),
                    refresh_id = %summary.refresh_id,
                    records = summary.record_count,
                    "scheduled refresh succeeded"
                );
                SchedulerState::Idle
            }
            Ok(RefreshOutcome::AlreadyInProgress) => SchedulerState::Idle,
            Err(e) => match e.class() {
                ErrorClass::Cooldown => {
                    let backoff = e.retry_after().unwrap_or(self.default_backoff);
                    let until = self.engine.clock().now() + to_chrono(backoff);
                    warn!(
                        cache_type = self.engine.cache_type(),
                        error = %e,
                        retry_after_ms = backoff.as_millis() as u64,
                        "refresh rate limited, cooling down"
                    );
                    SchedulerState::Cooldown { until }
                }
                ErrorClass::Cancelled => {
                    info!(cache_type = self.engine.cache_type(), "refresh cancelled");
                    SchedulerState::Idle
                }
                ErrorClass::NextTick => {
                    error!(cache_type = self.engine.cache_type(), error = %e, "refresh failed");
                    SchedulerState::Idle
                }
            },
        };
        signals.set_state(next);
    }
}

/// Control surface for a running scheduler task.
///
/// Dropping the handle leaves the task running; call [`shutdown`](Self::shutdown)
/// to stop it.
pub struct SchedulerHandle {
    signals: Arc<SchedulerSignals>,
    cancel: CancellationToken,
    grace: Duration,
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Non-blocking; `false` when a refresh is running, cooling down, or already requested.
    pub fn force_refresh(&self) -> bool {
        self.signals.request_refresh()
    }

    pub fn state(&self) -> SchedulerState {
        self.signals.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.signals.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.signals.is_running()
    }

    /// Cancel the loop and any in-flight fetch, waiting up to the grace period.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let Some(mut join) = self.join.take() else {
            return;
        };
        match tokio::time::timeout(self.grace, &mut join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "scheduler task ended abnormally"),
            Err(_) => {
                warn!(grace_secs = self.grace.as_secs(), "scheduler did not stop in time, aborting");
                join.abort();
                self.signals.running.store(false, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_requires_running_idle_scheduler() {
        let signals = SchedulerSignals::new();
        assert!(!signals.request_refresh());

        signals.running.store(true, Ordering::SeqCst);
        assert!(signals.request_refresh());
        // Second request before the loop wakes up is folded into the first.
        assert!(!signals.request_refresh());
        assert!(signals.take_force());
        assert!(!signals.take_force());

        signals.set_state(SchedulerState::Refreshing);
        assert!(!signals.request_refresh());

        signals.set_state(SchedulerState::Cooldown { until: Utc::now() });
        assert!(!signals.request_refresh());
    }

    #[tokio::test]
    async fn test_state_changes_are_observable() {
        let signals = SchedulerSignals::new();
        let mut rx = signals.subscribe();
        signals.set_state(SchedulerState::Refreshing);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SchedulerState::Refreshing);
    }
}

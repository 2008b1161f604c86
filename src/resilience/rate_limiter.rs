use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::{elapsed_between, to_chrono, SharedClock};
use crate::config::RateLimitConfig;

/// A rolling call budget.
#[derive(Debug, Clone)]
pub struct RateWindow {
    pub label: String,
    pub calls_made: u32,
    pub window_start: DateTime<Utc>,
    pub ceiling: u32,
    pub window_duration: Duration,
}

impl RateWindow {
    pub fn new(label: impl Into<String>, ceiling: u32, window_duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            label: label.into(),
            calls_made: 0,
            window_start: now,
            ceiling,
            window_duration,
        }
    }

    /// Lazy reset: a window older than its duration starts over at `now`.
    fn roll(&mut self, now: DateTime<Utc>) {
        if elapsed_between(self.window_start, now) >= self.window_duration {
            self.calls_made = 0;
            self.window_start = now;
        }
    }

    fn is_exhausted(&self) -> bool {
        self.calls_made >= self.ceiling
    }

    pub fn remaining(&self) -> u32 {
        self.ceiling.saturating_sub(self.calls_made)
    }

    pub fn resets_in(&self, now: DateTime<Utc>) -> Duration {
        self.window_duration
            .saturating_sub(elapsed_between(self.window_start, now))
    }
}

/// Outcome of [`RateLimiter::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { reason: String, retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub label: String,
    pub calls_made: u32,
    pub ceiling: u32,
    pub remaining: u32,
    pub resets_in: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiterSnapshot {
    pub windows: Vec<WindowSnapshot>,
    /// Remaining upstream-imposed backoff, if one is active.
    pub backoff_remaining: Option<Duration>,
}

impl RateLimiterSnapshot {
    /// The first (shortest) configured window.
    pub fn primary(&self) -> Option<&WindowSnapshot> {
        self.windows.first()
    }
}

#[derive(Debug)]
struct State {
    windows: Vec<RateWindow>,
    /// Set by an explicit upstream cooldown (HTTP 429 and friends).
    blocked_until: Option<DateTime<Utc>>,
}

/// Multi-window call counter.
///
/// - Every configured window is checked independently; any exhausted window denies
/// - Windows reset lazily on access
/// - No configured windows means unlimited
pub struct RateLimiter {
    state: Mutex<State>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        let windows = cfg
            .windows
            .iter()
            .map(|w| RateWindow::new(w.label.clone(), w.ceiling, w.window(), now))
            .collect();
        Self {
            state: Mutex::new(State {
                windows,
                blocked_until: None,
            }),
            clock,
        }
    }

    /// Take one call from every window, or explain why not.
    pub async fn try_acquire(&self) -> RateDecision {
        let now = self.clock.now();
        let mut st = self.state.lock().await;

        if let Some(until) = st.blocked_until {
            if until > now {
                let wait = elapsed_between(now, until);
                return RateDecision::Denied {
                    reason: format!("upstream backoff active for another {}s", wait.as_secs()),
                    retry_after: wait,
                };
            }
            st.blocked_until = None;
        }

        for w in st.windows.iter_mut() {
            w.roll(now);
        }

        let exhausted: Vec<&RateWindow> = st.windows.iter().filter(|w| w.is_exhausted()).collect();
        if !exhausted.is_empty() {
            let retry_after = exhausted
                .iter()
                .map(|w| w.resets_in(now))
                .max()
                .unwrap_or(Duration::ZERO);
            let reason = exhausted
                .iter()
                .map(|w| {
                    format!(
                        "{} window exhausted ({}/{} calls, resets in {}s)",
                        w.label,
                        w.calls_made,
                        w.ceiling,
                        w.resets_in(now).as_secs()
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            debug!(reason = reason.as_str(), "rate limiter denied call");
            return RateDecision::Denied {
                reason,
                retry_after,
            };
        }

        for w in st.windows.iter_mut() {
            w.calls_made = w.calls_made.saturating_add(1);
        }
        RateDecision::Allowed
    }

    /// Force callers to wait at least `retry_after`, whatever the windows say.
    pub async fn record_external_backoff(&self, retry_after: Duration) {
        let until = self.clock.now() + to_chrono(retry_after);
        let mut st = self.state.lock().await;
        let extended = match st.blocked_until {
            Some(existing) if existing >= until => existing,
            _ => until,
        };
        st.blocked_until = Some(extended);
        warn!(
            retry_after_ms = retry_after.as_millis() as u64,
            "upstream requested backoff"
        );
    }

    /// Align local counters with usage the upstream reports (one value per window, in order).
    ///
    /// Counters only ever move up; a lower upstream figure means our own calls
    /// have not been accounted for there yet.
    pub async fn sync_usage(&self, usage: &[u32]) {
        let now = self.clock.now();
        let mut st = self.state.lock().await;
        for (w, reported) in st.windows.iter_mut().zip(usage.iter()) {
            w.roll(now);
            if *reported > w.calls_made {
                w.calls_made = *reported;
            }
        }
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let now = self.clock.now();
        let mut st = self.state.lock().await;
        for w in st.windows.iter_mut() {
            w.roll(now);
        }
        let backoff_remaining = st
            .blocked_until
            .filter(|until| *until > now)
            .map(|until| elapsed_between(now, until));
        RateLimiterSnapshot {
            windows: st
                .windows
                .iter()
                .map(|w| WindowSnapshot {
                    label: w.label.clone(),
                    calls_made: w.calls_made,
                    ceiling: w.ceiling,
                    remaining: w.remaining(),
                    resets_in: w.resets_in(now),
                })
                .collect(),
            backoff_remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{system_clock, ManualClock};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        ))
    }

    fn strava_limits() -> RateLimitConfig {
        RateLimitConfig::new()
            .with_window("15m", 200, Duration::from_secs(15 * 60))
            .with_window("daily", 1000, Duration::from_secs(24 * 60 * 60))
    }

    #[tokio::test]
    async fn test_ceiling_then_rollover() {
        let clock = manual_clock();
        let limiter = RateLimiter::new(&strava_limits(), clock.clone());

        for i in 0..200 {
            assert!(limiter.try_acquire().await.is_allowed(), "call {} denied", i);
        }
        match limiter.try_acquire().await {
            RateDecision::Denied { reason, retry_after } => {
                assert!(reason.contains("15m"));
                assert_eq!(retry_after, Duration::from_secs(15 * 60));
            }
            RateDecision::Allowed => panic!("201st call should be denied"),
        }

        clock.advance(Duration::from_secs(15 * 60));
        assert!(limiter.try_acquire().await.is_allowed());

        let snap = limiter.snapshot().await;
        assert_eq!(snap.primary().unwrap().calls_made, 1);
        assert_eq!(snap.windows[1].calls_made, 201);
    }

    #[tokio::test]
    async fn test_long_window_denies_independently() {
        let clock = manual_clock();
        let cfg = RateLimitConfig::new()
            .with_window("short", 5, Duration::from_secs(60))
            .with_window("long", 7, Duration::from_secs(3600));
        let limiter = RateLimiter::new(&cfg, clock.clone());

        for _ in 0..5 {
            assert!(limiter.try_acquire().await.is_allowed());
        }
        assert!(!limiter.try_acquire().await.is_allowed());

        clock.advance(Duration::from_secs(61));
        assert!(limiter.try_acquire().await.is_allowed());
        assert!(limiter.try_acquire().await.is_allowed());
        match limiter.try_acquire().await {
            RateDecision::Denied { reason, .. } => {
                assert!(reason.contains("long"));
                assert!(!reason.contains("short"));
            }
            RateDecision::Allowed => panic!("long window should be exhausted"),
        }
    }

    #[tokio::test]
    async fn test_external_backoff_overrides_windows() {
        let clock = manual_clock();
        let limiter = RateLimiter::new(&strava_limits(), clock.clone());

        limiter.record_external_backoff(Duration::from_secs(30)).await;
        let denied = limiter.try_acquire().await;
        assert!(matches!(denied, RateDecision::Denied { retry_after, .. } if retry_after == Duration::from_secs(30)));
        assert_eq!(
            limiter.snapshot().await.backoff_remaining,
            Some(Duration::from_secs(30))
        );

        // A shorter backoff never shortens an active one.
        limiter.record_external_backoff(Duration::from_secs(5)).await;
        clock.advance(Duration::from_secs(10));
        assert!(!limiter.try_acquire().await.is_allowed());

        clock.advance(Duration::from_secs(20));
        assert!(limiter.try_acquire().await.is_allowed());
        assert!(limiter.snapshot().await.backoff_remaining.is_none());
    }

    #[tokio::test]
    async fn test_sync_usage_only_raises_counters() {
        let clock = manual_clock();
        let limiter = RateLimiter::new(&strava_limits(), clock);
        for _ in 0..10 {
            limiter.try_acquire().await;
        }

        limiter.sync_usage(&[199, 4]).await;
        let snap = limiter.snapshot().await;
        assert_eq!(snap.windows[0].calls_made, 199);
        assert_eq!(snap.windows[1].calls_made, 10);

        assert!(limiter.try_acquire().await.is_allowed());
        assert!(!limiter.try_acquire().await.is_allowed());
    }

    #[tokio::test]
    async fn test_no_windows_is_unlimited() {
        let limiter = RateLimiter::new(&RateLimitConfig::new(), system_clock());
        for _ in 0..1000 {
            assert!(limiter.try_acquire().await.is_allowed());
        }
        assert!(limiter.snapshot().await.primary().is_none());
    }
}

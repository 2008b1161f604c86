use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use super::core::RefreshTrigger;
use crate::enrichment::SweepReport;
use crate::resilience::rate_limiter::WindowSnapshot;
use crate::scheduler::SchedulerState;

/// Facts about one completed refresh cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshSummary {
    pub refresh_id: Uuid,
    pub trigger: RefreshTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Raw records returned by the fetcher, before filtering.
    pub fetched: usize,
    pub rejected: usize,
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub dropped: usize,
    pub record_count: usize,
    pub sweep: SweepReport,
}

/// Point-in-time view of an engine for status endpoints and logs.
///
/// `calls_this_window`, `ceiling` and `remaining` describe the first configured
/// rate window; `windows` has all of them.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub cache_type: String,
    pub calls_this_window: u32,
    pub ceiling: u32,
    pub remaining: u32,
    pub backoff_remaining: Option<Duration>,
    pub windows: Vec<WindowSnapshot>,
    /// `generated_at` of the snapshot readers currently see.
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_enrichment_sweep_at: Option<DateTime<Utc>>,
    pub record_count: usize,
    pub state: SchedulerState,
    pub refreshing: bool,
    pub last_refresh: Option<RefreshSummary>,
    pub last_error: Option<String>,
}

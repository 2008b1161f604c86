//! 补全模块：决定何时、以何种频率重新抓取缺失的补全字段。
//!
//! # Enrichment Reconciliation
//!
//! Enrichment is expensive (one upstream call per record) and sometimes
//! impossible (a record with no photos will never have photos). Fields are
//! therefore split in two tiers:
//!
//! - **essential** fields always exist upstream and are retried until obtained;
//! - **optional** fields are retried at most `max_optional_retries` times.
//!
//! Only recent records are considered, and a record is not retried again
//! before its cooldown has elapsed.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{elapsed_between, Clock};
use crate::config::EnrichmentPolicy;
use crate::fetch::{Fetcher, RetryingClient};
use crate::types::Record;
use crate::{Error, ErrorClass};

/// Why a record is or is not due for an enrichment fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    MissingEssential,
    MissingOptional,
    Complete,
    TooOld,
    CoolingDown,
    RetriesExhausted,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::MissingEssential | Eligibility::MissingOptional)
    }
}

pub fn eligibility(record: &Record, policy: &EnrichmentPolicy, now: DateTime<Utc>) -> Eligibility {
    if elapsed_between(record.basic.occurred_at, now) > policy.freshness_window() {
        return Eligibility::TooOld;
    }
    if let Some(last) = record.last_enrichment_attempt_at {
        if elapsed_between(last, now) < policy.cooldown() {
            return Eligibility::CoolingDown;
        }
    }
    if record.is_missing_any(&policy.essential_fields) {
        return Eligibility::MissingEssential;
    }
    if record.is_missing_any(&policy.optional_fields) {
        if record.enrichment_retry_count < policy.max_optional_retries {
            return Eligibility::MissingOptional;
        }
        return Eligibility::RetriesExhausted;
    }
    Eligibility::Complete
}

pub fn is_eligible(record: &Record, policy: &EnrichmentPolicy, now: DateTime<Utc>) -> bool {
    eligibility(record, policy, now).is_eligible()
}

/// Indices of records due for enrichment, in record order, capped at `max_per_sweep`.
pub fn select_candidates(records: &[Record], policy: &EnrichmentPolicy, now: DateTime<Utc>) -> Vec<usize> {
    records
        .iter()
        .enumerate()
        .filter(|(_, r)| is_eligible(r, policy, now))
        .map(|(i, _)| i)
        .take(policy.max_per_sweep)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepStop {
    /// Every selected candidate was attempted.
    Finished,
    /// The upstream budget ran out; the remaining candidates wait for the next sweep.
    RateLimited { retry_after: Option<Duration> },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub candidates: usize,
    pub attempted: usize,
    /// Attempts after which the record had every tracked field.
    pub completed: usize,
    /// Successful fetches that still left fields missing.
    pub incomplete: usize,
    pub failed: usize,
    pub stop: SweepStop,
}

impl SweepReport {
    fn new(candidates: usize) -> Self {
        Self {
            candidates,
            attempted: 0,
            completed: 0,
            incomplete: 0,
            failed: 0,
            stop: SweepStop::Finished,
        }
    }
}

/// One enrichment pass over `records`, fetching through the shared client.
pub async fn reconcile(
    records: &mut [Record],
    client: &RetryingClient,
    fetcher: &dyn Fetcher,
    policy: &EnrichmentPolicy,
    clock: &dyn Clock,
) -> SweepReport {
    let candidates = select_candidates(records, policy, clock.now());
    let mut report = SweepReport::new(candidates.len());
    if candidates.is_empty() {
        debug!("no records due for enrichment");
        return report;
    }

    for idx in candidates {
        if client.cancellation().is_cancelled() {
            report.stop = SweepStop::Cancelled;
            break;
        }
        let id = records[idx].id.clone();
        match client.fetch_enrichment(fetcher, &id).await {
            Ok(fields) => {
                let record = &mut records[idx];
                record.enriched.absorb(&fields);
                record.last_enrichment_attempt_at = Some(clock.now());
                report.attempted += 1;
                if record.is_missing_any(&policy.essential_fields)
                    || record.is_missing_any(&policy.optional_fields)
                {
                    record.enrichment_retry_count = record.enrichment_retry_count.saturating_add(1);
                    report.incomplete += 1;
                    debug!(
                        record_id = id.as_str(),
                        retry_count = record.enrichment_retry_count,
                        "record still incomplete after enrichment"
                    );
                } else {
                    report.completed += 1;
                }
            }
            Err(e) => match e.class() {
                ErrorClass::Cooldown => {
                    info!(record_id = id.as_str(), error = %e, "enrichment sweep stopped by rate limit");
                    report.stop = SweepStop::RateLimited {
                        retry_after: e.retry_after(),
                    };
                    break;
                }
                ErrorClass::Cancelled => {
                    report.stop = SweepStop::Cancelled;
                    break;
                }
                ErrorClass::NextTick => {
                    let record = &mut records[idx];
                    record.last_enrichment_attempt_at = Some(clock.now());
                    record.enrichment_retry_count = record.enrichment_retry_count.saturating_add(1);
                    report.attempted += 1;
                    report.failed += 1;
                    warn!(record_id = id.as_str(), error = %e, "enrichment fetch failed");
                    if matches!(e, Error::AuthFailed { .. }) {
                        // Every further call would be rejected the same way.
                        break;
                    }
                }
            },
        }
    }

    info!(
        candidates = report.candidates,
        attempted = report.attempted,
        completed = report.completed,
        incomplete = report.incomplete,
        failed = report.failed,
        stop = ?report.stop,
        "enrichment sweep finished"
    );
    report
}

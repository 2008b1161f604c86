//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use smart_cache::config::{EngineConfig, EnrichmentPolicy, RetryConfig};
use smart_cache::types::{EnrichedFields, RawRecord};
use smart_cache::{FetchError, Fetcher, PageParams};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
}

pub fn activity(id: &str, name: &str) -> RawRecord {
    RawRecord::new(id)
        .with_name(name)
        .with_kind("Ride")
        .with_occurred_at("2024-05-09T07:30:00Z")
        .with_magnitude(21.5)
}

pub fn essentials(id: &str) -> EnrichedFields {
    EnrichedFields::new()
        .with("polyline", json!(format!("poly-{}", id)))
        .with("bounds", json!([0.0, 0.0, 1.0, 1.0]))
}

/// Small, fast configuration: tight retry delays, essential `polyline`/`bounds`, optional `photos`.
pub fn test_config(cache_type: &str) -> EngineConfig {
    EngineConfig::new(cache_type)
        .with_enrichment(EnrichmentPolicy::new(&["polyline", "bounds"], &["photos"]))
        .with_retry(
            RetryConfig::default()
                .with_max_attempts(2)
                .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
        )
}

/// Fetcher serving a mutable listing and per-id enrichment, with injectable failures.
#[derive(Default)]
pub struct FakeFetcher {
    listing: Mutex<Vec<RawRecord>>,
    enrichment: Mutex<HashMap<String, EnrichedFields>>,
    batch_failures: Mutex<VecDeque<FetchError>>,
    pub batch_calls: AtomicU32,
    pub enrichment_calls: Mutex<Vec<String>>,
    cancel_on_enrichment: Mutex<Option<(String, CancellationToken)>>,
}

impl FakeFetcher {
    pub fn new(listing: Vec<RawRecord>) -> Self {
        let fetcher = Self::default();
        fetcher.set_listing(listing);
        fetcher
    }

    pub fn set_listing(&self, listing: Vec<RawRecord>) {
        *self.listing.lock().unwrap() = listing;
    }

    pub fn set_enrichment(&self, id: &str, fields: EnrichedFields) {
        self.enrichment.lock().unwrap().insert(id.to_string(), fields);
    }

    pub fn fail_next_batch(&self, err: FetchError) {
        self.batch_failures.lock().unwrap().push_back(err);
    }

    /// Cancel `token` while serving enrichment for `id`; the fetch itself still succeeds.
    pub fn cancel_when_enriching(&self, id: &str, token: CancellationToken) {
        *self.cancel_on_enrichment.lock().unwrap() = Some((id.to_string(), token));
    }

    pub fn batch_calls(&self) -> u32 {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn enrichment_calls(&self) -> Vec<String> {
        self.enrichment_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch_batch(&self, params: &PageParams) -> Result<Vec<RawRecord>, FetchError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.batch_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let per_page = params.per_page as usize;
        let skip = (params.page.saturating_sub(1) as usize) * per_page;
        Ok(self
            .listing
            .lock()
            .unwrap()
            .iter()
            .skip(skip)
            .take(per_page)
            .cloned()
            .collect())
    }

    async fn fetch_enrichment(&self, id: &str) -> Result<EnrichedFields, FetchError> {
        self.enrichment_calls.lock().unwrap().push(id.to_string());
        if let Some((target, token)) = self.cancel_on_enrichment.lock().unwrap().as_ref() {
            if target == id {
                token.cancel();
            }
        }
        Ok(self
            .enrichment
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

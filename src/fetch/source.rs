//! Capabilities the engine consumes from the scraping / API layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::types::{EnrichedFields, RawRecord};

/// Failure of a single upstream call, as reported by a fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// 401-equivalent: credentials expired or revoked.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// 429-equivalent: upstream asked us to slow down.
    #[error("throttled by upstream")]
    Throttled { retry_after: Option<Duration> },

    /// Connection, timeout or 5xx failure; worth retrying.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Any other non-success status; not retried.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
}

/// Which slice of the source listing to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageParams {
    /// 1-based page number.
    pub page: u32,
    pub per_page: u32,
    /// Only records after this instant, when the source supports it.
    pub after: Option<DateTime<Utc>>,
}

impl PageParams {
    pub fn first(per_page: u32) -> Self {
        Self {
            page: 1,
            per_page,
            after: None,
        }
    }

    pub fn next(&self) -> Self {
        Self {
            page: self.page + 1,
            ..self.clone()
        }
    }
}

/// Producer of raw records and their enrichment.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_batch(&self, params: &PageParams) -> Result<Vec<RawRecord>, FetchError>;

    async fn fetch_enrichment(&self, id: &str) -> Result<EnrichedFields, FetchError>;

    fn name(&self) -> &'static str {
        "fetcher"
    }
}

/// Hook invoked once per fetch when the upstream rejects our credentials.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self) -> Result<(), FetchError>;
}

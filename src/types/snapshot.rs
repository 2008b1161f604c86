//! The persisted cache unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::Record;

/// Complete cache state at a point in time.
///
/// `generated_at` is `None` only for a cache that was never populated; the
/// store refuses to persist a non-empty snapshot without it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_enrichment_sweep_at: Option<DateTime<Utc>>,
    pub records: Vec<Record>,
}

impl CacheSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(generated_at: DateTime<Utc>, records: Vec<Record>) -> Self {
        Self {
            generated_at: Some(generated_at),
            last_enrichment_sweep_at: None,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_populated(&self) -> bool {
        self.generated_at.is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    /// First `limit` records in source order (all of them for `None`).
    pub fn head(&self, limit: Option<usize>) -> Vec<Record> {
        match limit {
            Some(n) => self.records.iter().take(n).cloned().collect(),
            None => self.records.clone(),
        }
    }
}

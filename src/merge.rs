//! 合并模块：将新抓取的批次与已缓存记录按 id 对齐合并。
//!
//! # Smart Merge
//!
//! A fresh listing only ever carries basic fields (plus, occasionally, an
//! enrichment value the source happened to include). Merging it into the
//! cached records must therefore:
//!
//! - follow the fresh order, since it is the source's authoritative order;
//! - overwrite basic fields of known ids;
//! - keep enrichment and retry counters of known ids, overlaying only the
//!   non-null enrichment values the fresh record explicitly supplies;
//! - drop or retain vanished ids according to [`RetentionPolicy`].
//!
//! ```rust
//! use smart_cache::config::{RecordFilter, RetentionPolicy};
//! use smart_cache::merge::{merge, normalize_batch};
//! use smart_cache::types::RawRecord;
//! use serde_json::json;
//!
//! let raw = |id: &str| RawRecord::new(id).with_name("Ride").with_occurred_at("2024-05-01");
//! let cached = normalize_batch(vec![raw("1")], &RecordFilter::default()).records;
//! let cached: Vec<_> = cached
//!     .into_iter()
//!     .map(|r| r.with_enriched("polyline", json!("abc")))
//!     .collect();
//!
//! let fresh = normalize_batch(vec![raw("2"), raw("1")], &RecordFilter::default()).records;
//! let outcome = merge(&cached, fresh, RetentionPolicy::Drop);
//! assert_eq!(outcome.records[1].enriched.get("polyline"), Some(&json!("abc")));
//! assert_eq!(outcome.added, 1);
//! ```

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::config::{RecordFilter, RetentionPolicy};
use crate::types::{RawRecord, Record, RejectReason};

/// Fresh records that passed the filter, plus why the others did not.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<Record>,
    pub rejected: Vec<RejectReason>,
}

/// Drop malformed, excluded and duplicate records. First occurrence of an id wins.
pub fn normalize_batch(raw: Vec<RawRecord>, filter: &RecordFilter) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    let mut seen = HashSet::with_capacity(raw.len());
    for item in raw {
        match item.into_record(&filter.excluded_kinds) {
            Ok(record) => {
                if seen.insert(record.id.clone()) {
                    batch.records.push(record);
                } else {
                    batch.rejected.push(RejectReason::DuplicateId { id: record.id });
                }
            }
            Err(reason) => batch.rejected.push(reason),
        }
    }
    if !batch.rejected.is_empty() {
        debug!(
            accepted = batch.records.len(),
            rejected = batch.rejected.len(),
            first = %batch.rejected[0],
            "normalized fresh batch"
        );
    }
    batch
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub records: Vec<Record>,
    pub added: usize,
    /// Known ids whose basic or enriched fields changed.
    pub updated: usize,
    pub unchanged: usize,
    /// Known ids absent from the fresh batch and not retained.
    pub dropped: usize,
}

pub fn merge(existing: &[Record], fresh: Vec<Record>, retention: RetentionPolicy) -> MergeOutcome {
    let index: HashMap<&str, &Record> = existing.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut outcome = MergeOutcome {
        records: Vec::with_capacity(fresh.len()),
        ..Default::default()
    };
    let mut present: HashSet<String> = HashSet::with_capacity(fresh.len());

    for incoming in fresh {
        present.insert(incoming.id.clone());
        match index.get(incoming.id.as_str()) {
            Some(&cached) => {
                let mut merged = cached.clone();
                let basic_changed = merged.basic != incoming.basic;
                merged.basic = incoming.basic;
                let enriched_changed = merged.enriched.absorb(&incoming.enriched);
                if basic_changed || enriched_changed {
                    outcome.updated += 1;
                } else {
                    outcome.unchanged += 1;
                }
                outcome.records.push(merged);
            }
            None => {
                outcome.added += 1;
                outcome.records.push(Record {
                    enrichment_retry_count: 0,
                    last_enrichment_attempt_at: None,
                    ..incoming
                });
            }
        }
    }

    for cached in existing.iter().filter(|r| !present.contains(&r.id)) {
        match retention {
            RetentionPolicy::Drop => outcome.dropped += 1,
            RetentionPolicy::Retain => outcome.records.push(cached.clone()),
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(id: &str, name: &str) -> RawRecord {
        RawRecord::new(id)
            .with_name(name)
            .with_kind("Ride")
            .with_occurred_at("2024-05-01T07:00:00Z")
    }

    fn records(raws: Vec<RawRecord>) -> Vec<Record> {
        normalize_batch(raws, &RecordFilter::default()).records
    }

    #[test]
    fn test_normalize_filters_bad_records() {
        let filter = RecordFilter {
            excluded_kinds: vec!["virtualride".to_string()],
        };
        let batch = normalize_batch(
            vec![
                raw("1", "a"),
                RawRecord::new("").with_occurred_at("2024-05-01"),
                raw("2", "b").with_kind("VirtualRide"),
                RawRecord::new("3").with_occurred_at("yesterday"),
                raw("1", "dup"),
                raw("4", "d"),
            ],
            &filter,
        );
        let ids: Vec<_> = batch.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "4"]);
        assert_eq!(batch.records[0].basic.name, "a");
        assert_eq!(batch.rejected.len(), 4);
        assert!(batch
            .rejected
            .contains(&RejectReason::DuplicateId { id: "1".to_string() }));
    }

    #[test]
    fn test_merge_preserves_enrichment_and_counters() {
        let mut cached = records(vec![raw("1", "Morning Ride")]);
        cached[0].enriched.insert("polyline", json!("encoded"));
        cached[0].enrichment_retry_count = 2;

        let fresh = records(vec![raw("1", "Morning Ride (edited)").with_magnitude(42.0)]);
        let outcome = merge(&cached, fresh, RetentionPolicy::Drop);

        let r = &outcome.records[0];
        assert_eq!(r.basic.name, "Morning Ride (edited)");
        assert_eq!(r.basic.magnitude, Some(42.0));
        assert_eq!(r.enriched.get("polyline"), Some(&json!("encoded")));
        assert_eq!(r.enrichment_retry_count, 2);
        assert_eq!(outcome.updated, 1);
    }

    #[test]
    fn test_fresh_enrichment_overlays_but_nulls_do_not_erase() {
        let mut cached = records(vec![raw("1", "a")]);
        cached[0].enriched.insert("polyline", json!("old"));
        cached[0].enriched.insert("photos", json!(["p1"]));

        let mut incoming = raw("1", "a");
        incoming.enriched = [
            ("polyline".to_string(), json!("new")),
            ("photos".to_string(), serde_json::Value::Null),
        ]
        .into_iter()
        .collect();
        let outcome = merge(&cached, records(vec![incoming]), RetentionPolicy::Drop);

        let r = &outcome.records[0];
        assert_eq!(r.enriched.get("polyline"), Some(&json!("new")));
        assert_eq!(r.enriched.get("photos"), Some(&json!(["p1"])));
    }

    #[test]
    fn test_fresh_order_wins_and_vanished_ids_drop() {
        let cached = records(vec![raw("1", "a"), raw("2", "b"), raw("3", "c")]);
        let fresh = records(vec![raw("4", "d"), raw("3", "c"), raw("1", "a")]);
        let outcome = merge(&cached, fresh, RetentionPolicy::Drop);

        let ids: Vec<_> = outcome.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["4", "3", "1"]);
        assert_eq!(
            (outcome.added, outcome.updated, outcome.unchanged, outcome.dropped),
            (1, 0, 2, 1)
        );
    }

    #[test]
    fn test_retain_appends_vanished_ids_in_cached_order() {
        let cached = records(vec![raw("1", "a"), raw("2", "b"), raw("3", "c")]);
        let fresh = records(vec![raw("2", "b")]);
        let outcome = merge(&cached, fresh, RetentionPolicy::Retain);

        let ids: Vec<_> = outcome.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1", "3"]);
        assert_eq!(outcome.dropped, 0);
    }

    #[test]
    fn test_merge_with_itself_is_a_no_op() {
        let mut cached = records(vec![raw("1", "a"), raw("2", "b")]);
        cached[1].enriched.insert("bounds", json!([1, 2, 3, 4]));
        cached[1].enrichment_retry_count = 7;

        let outcome = merge(&cached, cached.clone(), RetentionPolicy::Drop);
        assert_eq!(outcome.records, cached);
        assert_eq!(outcome.unchanged, 2);
        assert_eq!(outcome.updated + outcome.added + outcome.dropped, 0);
    }

    #[test]
    fn test_new_records_start_with_zeroed_counters() {
        let mut incoming = records(vec![raw("9", "new")]);
        incoming[0].enrichment_retry_count = 3;
        let outcome = merge(&[], incoming, RetentionPolicy::Drop);
        assert_eq!(outcome.records[0].enrichment_retry_count, 0);
        assert_eq!(outcome.added, 1);
    }
}

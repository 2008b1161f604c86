//! 类型模块：缓存快照与记录的核心数据类型。
//!
//! # Types Module
//!
//! Core data types shared by every component of the engine.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`CacheSnapshot`] | The persisted unit: fetch timestamps plus ordered records |
//! | [`Record`] | A cached entity: fixed basic fields plus open enrichment map |
//! | [`BasicFields`] | Volatile attributes, overwritten by every fetch |
//! | [`EnrichedFields`] | Lazily fetched attributes, preserved across fetches |
//! | [`RawRecord`] | Unvalidated record as produced by a fetcher |
//!
//! ```rust
//! use smart_cache::types::RawRecord;
//!
//! let record = RawRecord::new("1042")
//!     .with_name("Lunch Ride")
//!     .with_kind("Ride")
//!     .with_occurred_at("2024-05-01T12:00:00Z")
//!     .into_record(&[])
//!     .unwrap();
//! assert!(record.enriched.is_empty());
//! ```

pub mod record;
pub mod snapshot;

pub use record::{parse_timestamp, BasicFields, EnrichedFields, RawRecord, Record, RejectReason};
pub use snapshot::CacheSnapshot;

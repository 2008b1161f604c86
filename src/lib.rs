//! # smart-cache
//!
//! 面向限流外部数据源的智能缓存引擎：抓取、合并、补全、校验与自动刷新。
//!
//! A smart cache engine for slowly-changing data behind rate-limited external
//! sources.
//!
//! ## Overview
//!
//! The engine fetches a listing through a caller-supplied [`Fetcher`], merges it
//! with previously cached records without ever losing enrichment, lazily fetches
//! missing enrichment within the upstream rate budget, and persists the result
//! as a validated snapshot with rolling backups. A background scheduler keeps
//! the snapshot fresh, backs off when the upstream says so, and rebuilds from
//! scratch when stored data turns out to be unrecoverable.
//!
//! ## Core Ideas
//!
//! - **Never lose enrichment**: a basic-only fetch only overwrites basic fields
//! - **Never exceed the budget**: every call, listing or enrichment, passes the same limiter
//! - **Never serve garbage**: everything read from storage is validated; corrupt
//!   snapshots fall back to backups
//! - **Readers never wait**: the current snapshot is an atomic pointer swap away
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smart_cache::{CacheEngineBuilder, EngineConfig, Fetcher};
//! use std::sync::Arc;
//!
//! # async fn run(fetcher: Arc<dyn Fetcher>) -> smart_cache::Result<()> {
//! let config = EngineConfig::new("activities").with_store_dir("/var/cache/smart-cache");
//! let engine = Arc::new(CacheEngineBuilder::new(config).fetcher(fetcher).build()?);
//!
//! let scheduler = engine.start()?;
//! let recent = engine.get_snapshot(Some(10)).await;
//! let stats = engine.stats().await;
//! println!("{} records, {}/{} calls", recent.len(), stats.calls_this_window, stats.ceiling);
//!
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | Snapshot and record types |
//! | [`store`] | Persistence, validation, backups, memory view |
//! | [`resilience`] | Multi-window rate limiter |
//! | [`fetch`] | Fetcher traits and the rate-gated retry client |
//! | [`merge`] | Fresh/cached reconciliation |
//! | [`enrichment`] | Enrichment eligibility and sweeps |
//! | [`engine`] | One cache instance and its refresh cycle |
//! | [`scheduler`] | Background refresh loop |
//! | [`config`] | YAML / env configuration |

pub mod clock;
pub mod config;
pub mod engine;
pub mod enrichment;
pub mod fetch;
pub mod merge;
pub mod resilience;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use config::{EngineConfig, RetentionPolicy};
pub use engine::{CacheEngine, CacheEngineBuilder, EngineStats, RefreshOutcome, RefreshTrigger};
pub use fetch::{CredentialRefresher, FetchError, Fetcher, PageParams};
pub use scheduler::{SchedulerHandle, SchedulerState};
pub use store::{CacheStore, LoadOutcome, LoadSource};
pub use types::{CacheSnapshot, EnrichedFields, RawRecord, Record};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorClass, ErrorContext};

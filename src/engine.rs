//! 引擎模块：组合存储、限流、抓取与合并的单一缓存实例。
//!
//! # Cache Engine
//!
//! One [`CacheEngine`] per cache type. It owns the store, the rate budget and
//! the retrying client, and exposes the read API plus a single refresh cycle;
//! the [`scheduler`](crate::scheduler) decides when that cycle runs.
//!
//! ```rust,no_run
//! use smart_cache::config::EngineConfig;
//! use smart_cache::engine::CacheEngineBuilder;
//! use smart_cache::fetch::Fetcher;
//! use std::sync::Arc;
//!
//! # async fn run(fetcher: Arc<dyn Fetcher>) -> smart_cache::Result<()> {
//! let config = EngineConfig::from_yaml_file("smart-cache.yaml").await?;
//! let engine = Arc::new(CacheEngineBuilder::new(config).fetcher(fetcher).build()?);
//! let scheduler = engine.start()?;
//!
//! let latest = engine.get_snapshot(Some(20)).await;
//! println!("{} records, state {:?}", latest.len(), scheduler.state());
//!
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod core;
pub mod stats;

pub use builder::CacheEngineBuilder;
pub use core::{CacheEngine, RefreshOutcome, RefreshTrigger};
pub use stats::{EngineStats, RefreshSummary};

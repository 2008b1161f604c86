//! 存储模块：快照持久化、内存视图、备份与恢复。
//!
//! # Cache Store Module
//!
//! Durable storage for one [`CacheSnapshot`](crate::types::CacheSnapshot) per
//! cache type, with a short-lived in-memory view in front of it.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheStore`] | Load/save/restore/prune with a TTL memory view |
//! | [`SnapshotBackend`] | Raw byte storage trait |
//! | [`FileBackend`] | `<dir>/<type>.json` plus timestamped backups |
//! | [`MemoryBackend`] | Process-local backend |
//! | [`validate_bytes`] | Structural check applied to everything read from storage |
//!
//! ## Recovery
//!
//! Every save first copies the previous (valid) primary to a backup, then
//! replaces the primary atomically. On load, a primary that fails validation
//! is replaced by the newest backup that passes it. If none does, the store
//! hands back an empty snapshot flagged for an emergency refresh.
//!
//! ```rust
//! use smart_cache::clock::system_clock;
//! use smart_cache::config::StoreConfig;
//! use smart_cache::store::{CacheStore, LoadSource, MemoryBackend};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> smart_cache::Result<()> {
//! let store = CacheStore::open(
//!     "activities",
//!     &StoreConfig::default(),
//!     Arc::new(MemoryBackend::new()),
//!     system_clock(),
//! );
//! let outcome = store.load().await?;
//! assert_eq!(outcome.source, LoadSource::Empty);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache_store;
pub mod validate;

pub use backend::{BackupId, FileBackend, MemoryBackend, SnapshotBackend};
pub use cache_store::{CacheStore, LoadOutcome, LoadSource, RefreshGuard};
pub use validate::{validate_bytes, validate_snapshot};

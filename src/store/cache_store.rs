//! Durable snapshot with an in-memory TTL view, backups and restoration.

use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::backend::{BackupId, FileBackend, SnapshotBackend};
use super::validate::{validate_bytes, validate_snapshot};
use crate::clock::SharedClock;
use crate::config::StoreConfig;
use crate::types::CacheSnapshot;
use crate::{Error, ErrorContext, Result};

/// Where a loaded snapshot came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    Memory,
    Primary,
    Backup(BackupId),
    /// Nothing usable was found.
    Empty,
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub snapshot: Arc<CacheSnapshot>,
    pub source: LoadSource,
    /// Stored data existed but neither it nor any backup validated.
    pub emergency_refresh: bool,
}

/// Held for one refresh cycle; clears the refreshing flag on drop.
pub struct RefreshGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    refreshing: &'a AtomicBool,
}

impl<'a> RefreshGuard<'a> {
    fn new(lock: MutexGuard<'a, ()>, refreshing: &'a AtomicBool) -> Self {
        refreshing.store(true, Ordering::SeqCst);
        Self { _lock: lock, refreshing }
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.refreshing.store(false, Ordering::SeqCst);
    }
}

struct MemoryView {
    snapshot: Arc<CacheSnapshot>,
    loaded_at: Instant,
}

pub struct CacheStore {
    cache_type: String,
    backend: Arc<dyn SnapshotBackend>,
    memory_ttl: Duration,
    keep_backups: usize,
    view: ArcSwapOption<MemoryView>,
    refresh_lock: Mutex<()>,
    refreshing: AtomicBool,
    closed: AtomicBool,
    clock: SharedClock,
}

impl CacheStore {
    pub fn open(
        cache_type: impl Into<String>,
        config: &StoreConfig,
        backend: Arc<dyn SnapshotBackend>,
        clock: SharedClock,
    ) -> Self {
        let cache_type = cache_type.into();
        info!(
            cache_type = cache_type.as_str(),
            backend = backend.name(),
            keep_backups = config.keep_backups,
            "cache store opened"
        );
        Self {
            cache_type,
            backend,
            memory_ttl: config.memory_ttl(),
            keep_backups: config.keep_backups,
            view: ArcSwapOption::empty(),
            refresh_lock: Mutex::new(()),
            refreshing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            clock,
        }
    }

    /// Store backed by files under `config.dir`.
    pub fn open_dir(cache_type: impl Into<String>, config: &StoreConfig, clock: SharedClock) -> Self {
        let backend = Arc::new(FileBackend::new(config.dir.clone()));
        Self::open(cache_type, config, backend, clock)
    }

    /// Reject further saves and drop the in-memory view.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.view.store(None);
            info!(cache_type = self.cache_type.as_str(), "cache store closed");
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn cache_type(&self) -> &str {
        &self.cache_type
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::storage_with_context(
                "cache store is closed",
                ErrorContext::new()
                    .with_field_path(self.cache_type.clone())
                    .with_source("cache_store"),
            ))
        }
    }

    /// Last-known-good snapshot, regardless of TTL. Never touches storage.
    pub fn current(&self) -> Option<Arc<CacheSnapshot>> {
        self.view.load_full().map(|v| v.snapshot.clone())
    }

    /// Serialize refresh cycles. Held for load → merge → save.
    pub async fn lock_refresh(&self) -> RefreshGuard<'_> {
        RefreshGuard::new(self.refresh_lock.lock().await, &self.refreshing)
    }

    pub fn try_lock_refresh(&self) -> Option<RefreshGuard<'_>> {
        self.refresh_lock
            .try_lock()
            .ok()
            .map(|lock| RefreshGuard::new(lock, &self.refreshing))
    }

    /// Whether a refresh guard is held. Reads a flag; never touches the lock.
    pub fn is_refresh_locked(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    fn remember(&self, snapshot: Arc<CacheSnapshot>) {
        self.view.store(Some(Arc::new(MemoryView {
            snapshot,
            loaded_at: Instant::now(),
        })));
    }

    /// Load the snapshot, falling back to backups and finally to empty.
    pub async fn load(&self) -> Result<LoadOutcome> {
        self.ensure_open()?;

        if let Some(view) = self.view.load_full() {
            if view.loaded_at.elapsed() < self.memory_ttl {
                return Ok(LoadOutcome {
                    snapshot: view.snapshot.clone(),
                    source: LoadSource::Memory,
                    emergency_refresh: false,
                });
            }
        }

        let outcome = self.load_from_storage().await;
        if !outcome.emergency_refresh {
            self.remember(outcome.snapshot.clone());
        }
        Ok(outcome)
    }

    async fn load_from_storage(&self) -> LoadOutcome {
        let key = self.cache_type.as_str();
        match self.backend.read_primary(key).await {
            Ok(Some(bytes)) => match validate_bytes(&bytes) {
                Ok(snapshot) => {
                    debug!(cache_type = key, records = snapshot.len(), "loaded primary snapshot");
                    LoadOutcome {
                        snapshot: Arc::new(snapshot),
                        source: LoadSource::Primary,
                        emergency_refresh: false,
                    }
                }
                Err(e) => {
                    warn!(cache_type = key, error = %e, "primary snapshot failed validation");
                    self.recover(true).await
                }
            },
            Ok(None) => self.recover(false).await,
            Err(e) => {
                warn!(cache_type = key, error = %e, "primary snapshot unreadable");
                self.recover(true).await
            }
        }
    }

    async fn recover(&self, primary_damaged: bool) -> LoadOutcome {
        let key = self.cache_type.as_str();
        if let Some((snapshot, id)) = self.restore_from_backup().await {
            match serde_json::to_vec_pretty(&snapshot) {
                Ok(bytes) => {
                    if let Err(e) = self.backend.write_primary(key, &bytes).await {
                        warn!(cache_type = key, error = %e, "could not rewrite primary from backup");
                    }
                }
                Err(e) => warn!(cache_type = key, error = %e, "could not serialize restored backup"),
            }
            return LoadOutcome {
                snapshot: Arc::new(snapshot),
                source: LoadSource::Backup(id),
                emergency_refresh: false,
            };
        }

        if primary_damaged {
            error!(cache_type = key, "no valid snapshot or backup, emergency refresh required");
        } else {
            info!(cache_type = key, "no snapshot yet, starting empty");
        }
        LoadOutcome {
            snapshot: Arc::new(CacheSnapshot::empty()),
            source: LoadSource::Empty,
            emergency_refresh: primary_damaged,
        }
    }

    /// First backup, newest first, that validates.
    pub async fn restore_from_backup(&self) -> Option<(CacheSnapshot, BackupId)> {
        let key = self.cache_type.as_str();
        let ids = match self.backend.list_backups(key).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(cache_type = key, error = %e, "could not list backups");
                return None;
            }
        };
        for id in ids {
            let bytes = match self.backend.read_backup(key, &id).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(cache_type = key, backup = %id, error = %e, "backup unreadable");
                    continue;
                }
            };
            match validate_bytes(&bytes) {
                Ok(snapshot) => {
                    info!(
                        cache_type = key,
                        backup = %id,
                        records = snapshot.len(),
                        "restored snapshot from backup"
                    );
                    return Some((snapshot, id));
                }
                Err(e) => warn!(cache_type = key, backup = %id, error = %e, "backup failed validation"),
            }
        }
        None
    }

    /// Validate, back up the previous snapshot, replace it, prune, update memory.
    pub async fn save(&self, snapshot: CacheSnapshot) -> Result<()> {
        self.ensure_open()?;
        validate_snapshot(&snapshot)?;
        let key = self.cache_type.as_str();
        let data = serde_json::to_vec_pretty(&snapshot)?;

        match self.backend.read_primary(key).await {
            Ok(Some(previous)) => {
                if validate_bytes(&previous).is_ok() {
                    let id = self.next_backup_id().await?;
                    self.backend.write_backup(key, &id, &previous).await?;
                    debug!(cache_type = key, backup = %id, "backed up previous snapshot");
                } else {
                    warn!(cache_type = key, "previous snapshot invalid, not backed up");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(cache_type = key, error = %e, "previous snapshot unreadable, not backed up"),
        }

        self.backend.write_primary(key, &data).await?;

        if let Err(e) = self.prune_backups(self.keep_backups).await {
            warn!(cache_type = key, error = %e, "backup pruning failed");
        }

        info!(
            cache_type = key,
            records = snapshot.len(),
            bytes = data.len(),
            "snapshot saved"
        );
        self.remember(Arc::new(snapshot));
        Ok(())
    }

    async fn next_backup_id(&self) -> Result<BackupId> {
        let candidate = BackupId::at(self.clock.now());
        let newest = self.backend.list_backups(&self.cache_type).await?.into_iter().next();
        Ok(match newest {
            Some(newest) if newest >= candidate => newest.successor(),
            _ => candidate,
        })
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupId>> {
        self.backend.list_backups(&self.cache_type).await
    }

    /// Delete all but the newest `keep_last_n` backups. Returns how many were removed.
    pub async fn prune_backups(&self, keep_last_n: usize) -> Result<usize> {
        let key = self.cache_type.as_str();
        let mut removed = 0;
        for id in self.backend.list_backups(key).await?.iter().skip(keep_last_n) {
            if self.backend.delete_backup(key, id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(cache_type = key, removed, keep_last_n, "pruned backups");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{system_clock, ManualClock};
    use crate::store::backend::MemoryBackend;
    use crate::types::RawRecord;
    use chrono::{TimeZone, Utc};

    fn snapshot(ids: &[&str]) -> CacheSnapshot {
        let records = ids
            .iter()
            .map(|id| {
                RawRecord::new(*id)
                    .with_name(format!("record {}", id))
                    .with_kind("Run")
                    .with_occurred_at("2024-05-01T07:00:00Z")
                    .into_record(&[])
                    .unwrap()
            })
            .collect();
        CacheSnapshot::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(), records)
    }

    fn store(backend: Arc<MemoryBackend>, ttl: Duration, keep: usize) -> CacheStore {
        let config = StoreConfig::default()
            .with_memory_ttl(ttl)
            .with_keep_backups(keep);
        CacheStore::open("activities", &config, backend, system_clock())
    }

    #[tokio::test]
    async fn test_first_load_is_empty_without_emergency() {
        let s = store(Arc::new(MemoryBackend::new()), Duration::from_secs(300), 3);
        let outcome = s.load().await.unwrap();
        assert_eq!(outcome.source, LoadSource::Empty);
        assert!(!outcome.emergency_refresh);
        assert!(outcome.snapshot.generated_at.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load_uses_memory_until_ttl() {
        let backend = Arc::new(MemoryBackend::new());
        let s = store(backend.clone(), Duration::from_secs(300), 3);
        s.save(snapshot(&["1", "2"])).await.unwrap();

        let outcome = s.load().await.unwrap();
        assert_eq!(outcome.source, LoadSource::Memory);
        assert_eq!(outcome.snapshot.len(), 2);

        let cold = store(backend, Duration::ZERO, 3);
        let outcome = cold.load().await.unwrap();
        assert_eq!(outcome.source, LoadSource::Primary);
        assert_eq!(outcome.snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_save_backs_up_previous_and_prunes() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()));
        let config = StoreConfig::default().with_keep_backups(2);
        let s = CacheStore::open("activities", &config, backend.clone(), clock);

        s.save(snapshot(&["1"])).await.unwrap();
        assert!(s.list_backups().await.unwrap().is_empty());

        // Same simulated instant for every save: ids must still be distinct.
        s.save(snapshot(&["1", "2"])).await.unwrap();
        s.save(snapshot(&["1", "2", "3"])).await.unwrap();
        s.save(snapshot(&["1", "2", "3", "4"])).await.unwrap();

        let backups = s.list_backups().await.unwrap();
        assert_eq!(backups.len(), 2);
        let newest = backend.read_backup("activities", &backups[0]).await.unwrap().unwrap();
        assert_eq!(validate_bytes(&newest).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_primary_restores_newest_valid_backup() {
        let backend = Arc::new(MemoryBackend::new());
        let s = store(backend.clone(), Duration::ZERO, 5);
        s.save(snapshot(&["1"])).await.unwrap();
        s.save(snapshot(&["1", "2"])).await.unwrap();
        s.save(snapshot(&["1", "2", "3"])).await.unwrap();

        // Newest backup is damaged too; the one before it must win.
        let backups = s.list_backups().await.unwrap();
        backend.write_backup("activities", &backups[0], b"{\"records\":").await.unwrap();
        backend.write_primary("activities", b"{\"generated_at\":\"2024").await.unwrap();

        let outcome = s.load().await.unwrap();
        assert_eq!(outcome.source, LoadSource::Backup(backups[1]));
        assert!(!outcome.emergency_refresh);
        assert_eq!(*outcome.snapshot, snapshot(&["1"]));

        // Primary was rewritten from the backup.
        let primary = backend.read_primary("activities").await.unwrap().unwrap();
        assert_eq!(validate_bytes(&primary).unwrap(), snapshot(&["1"]));
    }

    #[tokio::test]
    async fn test_unrecoverable_corruption_signals_emergency() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write_primary("activities", b"garbage").await.unwrap();
        let s = store(backend, Duration::from_secs(300), 5);

        let outcome = s.load().await.unwrap();
        assert_eq!(outcome.source, LoadSource::Empty);
        assert!(outcome.emergency_refresh);
        assert!(outcome.snapshot.is_empty());
        assert!(s.current().is_none());
    }

    #[tokio::test]
    async fn test_save_rejects_invalid_snapshot() {
        let backend = Arc::new(MemoryBackend::new());
        let s = store(backend.clone(), Duration::from_secs(300), 5);
        let mut bad = snapshot(&["1"]);
        bad.generated_at = None;
        assert!(matches!(s.save(bad).await, Err(Error::Validation { .. })));
        assert_eq!(backend.read_primary("activities").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_work() {
        let s = store(Arc::new(MemoryBackend::new()), Duration::from_secs(300), 5);
        s.save(snapshot(&["1"])).await.unwrap();
        assert!(s.current().is_some());

        s.close();
        assert!(!s.is_open());
        assert!(s.current().is_none());
        assert!(s.save(snapshot(&["1"])).await.is_err());
        assert!(s.load().await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_lock_is_exclusive() {
        let s = store(Arc::new(MemoryBackend::new()), Duration::from_secs(300), 5);
        let guard = s.try_lock_refresh();
        assert!(guard.is_some());
        assert!(s.is_refresh_locked());
        assert!(s.try_lock_refresh().is_none());
        drop(guard);
        assert!(!s.is_refresh_locked());
    }

    #[tokio::test]
    async fn test_checking_refresh_state_never_blocks_a_refresh() {
        let s = store(Arc::new(MemoryBackend::new()), Duration::from_secs(300), 5);
        for _ in 0..100 {
            assert!(!s.is_refresh_locked());
            let guard = s.try_lock_refresh();
            assert!(guard.is_some());
            assert!(s.is_refresh_locked());
            // Polling the state while held must not make the holder lose the lock.
            assert!(s.is_refresh_locked());
            drop(guard);
        }

        let guard = s.lock_refresh().await;
        assert!(s.is_refresh_locked());
        drop(guard);
        assert!(!s.is_refresh_locked());
        assert!(s.try_lock_refresh().is_some());
    }
}

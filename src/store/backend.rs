//! Snapshot storage backends.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::{Error, ErrorContext, Result};

const BACKUP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";
const BACKUP_PARSE_FORMAT: &str = "%Y%m%dT%H%M%S%.fZ";

/// Identity of one backup: its creation time at microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupId {
    at: DateTime<Utc>,
}

impl BackupId {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at: at.trunc_subsecs(6),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(s, BACKUP_PARSE_FORMAT)
            .ok()
            .map(|naive| Self::at(naive.and_utc()))
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.at
    }

    /// The smallest id strictly after this one.
    pub fn successor(&self) -> Self {
        Self::at(self.at + chrono::Duration::microseconds(1))
    }
}

impl std::fmt::Display for BackupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.at.format(BACKUP_FORMAT))
    }
}

/// Raw byte storage for one primary snapshot per key plus its backups.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    async fn read_primary(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Replace the primary snapshot; readers see either the old or the new bytes.
    async fn write_primary(&self, key: &str, data: &[u8]) -> Result<()>;
    async fn write_backup(&self, key: &str, id: &BackupId, data: &[u8]) -> Result<()>;
    /// Newest first.
    async fn list_backups(&self, key: &str) -> Result<Vec<BackupId>>;
    async fn read_backup(&self, key: &str, id: &BackupId) -> Result<Option<Vec<u8>>>;
    async fn delete_backup(&self, key: &str, id: &BackupId) -> Result<bool>;
    fn name(&self) -> &'static str;
}

/// Files in one directory: `<key>.json` and `<key>.backup.<id>.json`.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn primary_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub fn backup_path(&self, key: &str, id: &BackupId) -> PathBuf {
        self.dir.join(format!("{}.backup.{}.json", key, id))
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a sibling temp file, fsync, then rename over the target.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::storage_with_context(
                    "invalid snapshot path",
                    ErrorContext::new()
                        .with_field_path(path.display().to_string())
                        .with_source("file_backend"),
                )
            })?;
        let tmp = self
            .dir
            .join(format!(".{}.tmp-{}", file_name, Uuid::new_v4().simple()));

        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, path).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::storage_with_context(
                format!("atomic write failed: {}", e),
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_source("file_backend"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotBackend for FileBackend {
    async fn read_primary(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Self::read_optional(&self.primary_path(key)).await
    }

    async fn write_primary(&self, key: &str, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.primary_path(key), data).await
    }

    async fn write_backup(&self, key: &str, id: &BackupId, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.backup_path(key, id), data).await
    }

    async fn list_backups(&self, key: &str) -> Result<Vec<BackupId>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let prefix = format!("{}.backup.", key);
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(BackupId::parse)
            {
                ids.push(id);
            }
        }
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    async fn read_backup(&self, key: &str, id: &BackupId) -> Result<Option<Vec<u8>>> {
        Self::read_optional(&self.backup_path(key, id)).await
    }

    async fn delete_backup(&self, key: &str, id: &BackupId) -> Result<bool> {
        match tokio::fs::remove_file(self.backup_path(key, id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Process-local backend for tests and throwaway instances.
#[derive(Default)]
pub struct MemoryBackend {
    primary: RwLock<HashMap<String, Vec<u8>>>,
    backups: RwLock<HashMap<String, BTreeMap<BackupId, Vec<u8>>>>,
}

fn poisoned() -> Error {
    Error::storage_with_context(
        "memory backend lock poisoned",
        ErrorContext::new().with_source("memory_backend"),
    )
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotBackend for MemoryBackend {
    async fn read_primary(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let primary = self.primary.read().map_err(|_| poisoned())?;
        Ok(primary.get(key).cloned())
    }

    async fn write_primary(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut primary = self.primary.write().map_err(|_| poisoned())?;
        primary.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn write_backup(&self, key: &str, id: &BackupId, data: &[u8]) -> Result<()> {
        let mut backups = self.backups.write().map_err(|_| poisoned())?;
        backups
            .entry(key.to_string())
            .or_default()
            .insert(*id, data.to_vec());
        Ok(())
    }

    async fn list_backups(&self, key: &str) -> Result<Vec<BackupId>> {
        let backups = self.backups.read().map_err(|_| poisoned())?;
        Ok(backups
            .get(key)
            .map(|m| m.keys().rev().copied().collect())
            .unwrap_or_default())
    }

    async fn read_backup(&self, key: &str, id: &BackupId) -> Result<Option<Vec<u8>>> {
        let backups = self.backups.read().map_err(|_| poisoned())?;
        Ok(backups.get(key).and_then(|m| m.get(id)).cloned())
    }

    async fn delete_backup(&self, key: &str, id: &BackupId) -> Result<bool> {
        let mut backups = self.backups.write().map_err(|_| poisoned())?;
        Ok(backups
            .get_mut(key)
            .map(|m| m.remove(id).is_some())
            .unwrap_or(false))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

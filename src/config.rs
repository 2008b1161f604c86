//! Engine configuration.
//!
//! Every field has a default, so a YAML file only needs to name what it
//! changes:
//!
//! ```yaml
//! cache_type: activities
//! store:
//!   dir: /var/lib/smart-cache
//!   keep_backups: 7
//! rate_limit:
//!   windows:
//!     - { label: 15m, ceiling: 200, window_secs: 900 }
//!     - { label: daily, ceiling: 1000, window_secs: 86400 }
//! enrichment:
//!   essential_fields: [polyline, bounds]
//!   optional_fields: [description, photos, comments]
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, ErrorContext, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Key for the persisted snapshot and its backups (e.g. "activities", "donations").
    pub cache_type: String,
    pub store: StoreConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub paging: PagingConfig,
    pub enrichment: EnrichmentPolicy,
    pub scheduler: SchedulerConfig,
    pub retention: RetentionPolicy,
    pub filter: RecordFilter,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_type: "activities".to_string(),
            store: StoreConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            paging: PagingConfig::default(),
            enrichment: EnrichmentPolicy::default(),
            scheduler: SchedulerConfig::default(),
            retention: RetentionPolicy::default(),
            filter: RecordFilter::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(cache_type: impl Into<String>) -> Self {
        Self {
            cache_type: cache_type.into(),
            ..Default::default()
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file, apply `SMART_CACHE_*` environment overrides, validate.
    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::configuration_with_context(
                format!("failed to read config: {}", e),
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_source("config_loader"),
            )
        })?;
        let mut config: EngineConfig = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = env::var("SMART_CACHE_DIR") {
            self.store.dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_u64("SMART_CACHE_REFRESH_INTERVAL_SECS") {
            self.scheduler.refresh_interval_secs = secs;
        }
        if let Some(secs) = env_u64("SMART_CACHE_MEMORY_TTL_SECS") {
            self.store.memory_ttl_secs = secs;
        }
        if let Some(n) = env_u64("SMART_CACHE_KEEP_BACKUPS") {
            self.store.keep_backups = n as usize;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: &str| {
            Err(Error::configuration_with_context(
                msg.to_string(),
                ErrorContext::new()
                    .with_field_path(field)
                    .with_source("config_validator"),
            ))
        };

        if self.cache_type.trim().is_empty()
            || self
                .cache_type
                .contains(|c: char| c == '/' || c == '\\' || c == '.')
        {
            return invalid("cache_type", "cache_type must be a plain, non-empty name");
        }
        for (i, w) in self.rate_limit.windows.iter().enumerate() {
            if w.ceiling == 0 || w.window_secs == 0 {
                return invalid(
                    &format!("rate_limit.windows[{}]", i),
                    "rate window needs a non-zero ceiling and duration",
                );
            }
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts", "at least one attempt is required");
        }
        if self.retry.attempt_timeout_secs == 0 {
            return invalid("retry.attempt_timeout_secs", "attempt timeout must be non-zero");
        }
        if self.paging.per_page == 0 || self.paging.max_pages == 0 {
            return invalid("paging", "per_page and max_pages must be non-zero");
        }
        if self.scheduler.tick_interval_secs == 0 {
            return invalid("scheduler.tick_interval_secs", "tick interval must be non-zero");
        }
        if self.scheduler.refresh_interval_secs == 0 {
            return invalid("scheduler.refresh_interval_secs", "refresh interval must be non-zero");
        }
        Ok(())
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store.dir = dir.into();
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_enrichment(mut self, policy: EnrichmentPolicy) -> Self {
        self.enrichment = policy;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: PathBuf,
    /// How long a loaded snapshot is served from memory before re-reading storage.
    pub memory_ttl_secs: u64,
    pub keep_backups: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache"),
            memory_ttl_secs: 300,
            keep_backups: 5,
        }
    }
}

impl StoreConfig {
    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }

    pub fn with_memory_ttl(mut self, ttl: Duration) -> Self {
        self.memory_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_keep_backups(mut self, keep: usize) -> Self {
        self.keep_backups = keep;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindowConfig {
    pub label: String,
    pub ceiling: u32,
    pub window_secs: u64,
}

impl RateWindowConfig {
    pub fn new(label: impl Into<String>, ceiling: u32, window: Duration) -> Self {
        Self {
            label: label.into(),
            ceiling,
            window_secs: window.as_secs(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub windows: Vec<RateWindowConfig>,
    /// Cooldown used when a denial carries no better estimate.
    pub default_backoff_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            windows: vec![
                RateWindowConfig::new("15m", 200, Duration::from_secs(15 * 60)),
                RateWindowConfig::new("daily", 1000, Duration::from_secs(24 * 60 * 60)),
            ],
            default_backoff_secs: 15 * 60,
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self {
            windows: Vec::new(),
            ..Default::default()
        }
    }

    pub fn with_window(mut self, label: impl Into<String>, ceiling: u32, window: Duration) -> Self {
        self.windows.push(RateWindowConfig::new(label, ceiling, window));
        self
    }

    pub fn default_backoff(&self) -> Duration {
        Duration::from_secs(self.default_backoff_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total calls per fetch, including the first one.
    pub max_attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Longest upstream `Retry-After` honored by sleeping inside a refresh.
    pub max_inline_wait_secs: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay_ms: 500,
            max_delay_ms: 30_000,
            max_inline_wait_secs: 60,
            attempt_timeout_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_delays(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay_ms = min.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_max_inline_wait(mut self, wait: Duration) -> Self {
        self.max_inline_wait_secs = wait.as_secs();
        self
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn max_inline_wait(&self) -> Duration {
        Duration::from_secs(self.max_inline_wait_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    pub per_page: u32,
    pub max_pages: u32,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            per_page: 200,
            max_pages: 3,
        }
    }
}

/// Which enrichment keys matter and how hard to chase them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentPolicy {
    /// Always obtainable; retried without limit.
    pub essential_fields: Vec<String>,
    /// May legitimately not exist; retried up to `max_optional_retries`.
    pub optional_fields: Vec<String>,
    pub freshness_window_secs: u64,
    pub cooldown_secs: u64,
    pub max_optional_retries: u32,
    pub max_per_sweep: usize,
}

impl Default for EnrichmentPolicy {
    fn default() -> Self {
        Self {
            essential_fields: vec!["polyline".to_string(), "bounds".to_string()],
            optional_fields: vec![
                "description".to_string(),
                "photos".to_string(),
                "comments".to_string(),
            ],
            freshness_window_secs: 21 * 24 * 60 * 60,
            cooldown_secs: 24 * 60 * 60,
            max_optional_retries: 5,
            max_per_sweep: 50,
        }
    }
}

impl EnrichmentPolicy {
    pub fn new(essential: &[&str], optional: &[&str]) -> Self {
        Self {
            essential_fields: essential.iter().map(|s| s.to_string()).collect(),
            optional_fields: optional.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_secs = cooldown.as_secs();
        self
    }

    pub fn with_max_per_sweep(mut self, n: usize) -> Self {
        self.max_per_sweep = n;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the loop wakes up to check staleness.
    pub tick_interval_secs: u64,
    /// Minimum age of `generated_at` before a scheduled refresh runs.
    pub refresh_interval_secs: u64,
    /// Give a refresh in progress this long to finish on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60 * 60,
            refresh_interval_secs: 6 * 60 * 60,
            shutdown_grace_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// What happens to cached ids missing from a fresh listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// The fresh listing is authoritative for presence.
    #[default]
    Drop,
    /// Keep every id ever seen, after the fresh records.
    Retain,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordFilter {
    /// Kinds never admitted to the snapshot (case-insensitive).
    pub excluded_kinds: Vec<String>,
}

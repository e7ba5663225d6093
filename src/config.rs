use crate::core::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cache and write-back configuration, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one snapshot file per entity.
    pub data_dir: PathBuf,

    /// Period of the background dirty flush.
    pub flush_interval_ms: u64,

    /// Maximum snapshot writes in flight during one flush.
    pub flush_concurrency: usize,

    /// `fsync` every snapshot before it replaces the previous one.
    pub fsync: bool,

    /// Soft cap on resident entities; the oldest clean entries are evicted past it.
    pub max_cached: Option<usize>,

    /// Entities untouched for this long are flushed and evicted by the background worker.
    pub idle_evict_after_ms: Option<u64>,

    /// Period of the background mirror audit.
    pub audit_interval_ms: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/entities"),
            flush_interval_ms: 30_000,
            flush_concurrency: 16,
            fsync: true,
            max_cached: None,
            idle_evict_after_ms: None,
            audit_interval_ms: None,
        }
    }
}

impl CacheConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Loads a JSON config file; missing keys keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|e| {
            StateError::ConfigError(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_slice(&raw).map_err(|e| {
            StateError::ConfigError(format!("Failed to parse '{}': {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_ms == 0 {
            return Err(StateError::ConfigError(
                "flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.flush_concurrency == 0 {
            return Err(StateError::ConfigError(
                "flush_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.max_cached == Some(0) {
            return Err(StateError::ConfigError(
                "max_cached must be greater than zero when set".to_string(),
            ));
        }
        if self.audit_interval_ms == Some(0) {
            return Err(StateError::ConfigError(
                "audit_interval_ms must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn idle_evict_after(&self) -> Option<Duration> {
        self.idle_evict_after_ms.map(Duration::from_millis)
    }

    pub fn audit_interval(&self) -> Option<Duration> {
        self.audit_interval_ms.map(Duration::from_millis)
    }

    /// Set the flush period
    pub fn flush_interval_ms(mut self, interval_ms: u64) -> Self {
        self.flush_interval_ms = interval_ms;
        self
    }

    /// Set the number of concurrent snapshot writes
    pub fn flush_concurrency(mut self, concurrency: usize) -> Self {
        self.flush_concurrency = concurrency;
        self
    }

    pub fn fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn max_cached(mut self, max: usize) -> Self {
        self.max_cached = Some(max);
        self
    }

    pub fn idle_evict_after_ms(mut self, idle_ms: u64) -> Self {
        self.idle_evict_after_ms = Some(idle_ms);
        self
    }

    pub fn audit_interval_ms(mut self, interval_ms: u64) -> Self {
        self.audit_interval_ms = Some(interval_ms);
        self
    }
}

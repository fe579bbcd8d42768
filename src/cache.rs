//! TTL cache for fetch results and full run responses.
//!
//! An explicit service object passed into the pipeline (no process
//! globals): entries are `{data, timestamp}` pairs keyed by
//! `"<operation>:<args>"`, expiring a fixed TTL after write. Expired
//! entries read as absent and are evicted on access.
//!
//! Two backends behind the same trait: an in-memory map for tests and a
//! JSON file for production, which survives process restarts. Write-write
//! races on the same key resolve last-writer-wins.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Build a cache key from an operation name and its arguments.
pub fn cache_key(operation: &str, args: &[&str]) -> String {
    format!("{operation}:{}", args.join("|"))
}

/// A cached value with its write timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Backing store for cache entries.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Memory backend
// ---------------------------------------------------------------------------

/// Volatile map backend, used in tests and available for embedding.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

/// JSON-file backend. The whole map is loaded and rewritten under a
/// mutex on every mutation — entry counts here are small (one per
/// distinct query), durability across restarts is what matters.
pub struct FileBackend {
    path: PathBuf,
    io: Mutex<()>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io: Mutex::new(()),
        }
    }

    fn load_map(path: &Path) -> Result<HashMap<String, CacheEntry>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache file {}", path.display()))?;
        // A corrupt cache file is not worth failing a run over
        match serde_json::from_str(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cache file unreadable, starting empty");
                Ok(HashMap::new())
            }
        }
    }

    fn persist_map(path: &Path, map: &HashMap<String, CacheEntry>) -> Result<()> {
        let json = serde_json::to_string(map).context("Failed to serialise cache map")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write cache file {}", path.display()))
    }
}

#[async_trait]
impl CacheBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let _guard = self.io.lock().await;
        Ok(Self::load_map(&self.path)?.remove(key))
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let _guard = self.io.lock().await;
        let mut map = Self::load_map(&self.path)?;
        map.insert(key.to_string(), entry);
        Self::persist_map(&self.path, &map)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.io.lock().await;
        let mut map = Self::load_map(&self.path)?;
        if map.remove(key).is_some() {
            Self::persist_map(&self.path, &map)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cache service
// ---------------------------------------------------------------------------

/// TTL cache over a pluggable backend.
pub struct Cache {
    backend: Box<dyn CacheBackend>,
    ttl: Duration,
}

impl Cache {
    pub fn new(backend: Box<dyn CacheBackend>, ttl_hours: u64) -> Self {
        Self {
            backend,
            ttl: Duration::hours(ttl_hours as i64),
        }
    }

    pub fn in_memory(ttl_hours: u64) -> Self {
        Self::new(Box::<MemoryBackend>::default(), ttl_hours)
    }

    pub fn file_backed(path: impl Into<PathBuf>, ttl_hours: u64) -> Self {
        Self::new(Box::new(FileBackend::new(path)), ttl_hours)
    }

    /// Fetch and deserialize a live entry. Expired entries are evicted
    /// and read as absent; backend errors also read as absent (a broken
    /// cache must never break a run).
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = match self.backend.get(key).await {
            Ok(e) => e?,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        if Utc::now() - entry.timestamp >= self.ttl {
            debug!(key, written_at = %entry.timestamp, "Cache entry expired, evicting");
            if let Err(e) = self.backend.remove(key).await {
                warn!(key, error = %e, "Failed to evict expired cache entry");
            }
            return None;
        }

        match serde_json::from_value(entry.data) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "Cached value failed to deserialize, treating as miss");
                None
            }
        }
    }

    /// Serialize and store a value under `key`, stamped now.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) {
        let entry = CacheEntry {
            data: match serde_json::to_value(value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(key, error = %e, "Failed to serialise cache value, skipping");
                    return;
                }
            },
            timestamp: Utc::now(),
        };
        if let Err(e) = self.backend.set(key, entry).await {
            warn!(key, error = %e, "Cache write failed");
        }
    }

    /// Insert an entry with an explicit timestamp (tests exercise TTL
    /// boundaries with this).
    #[cfg(test)]
    async fn put_json_at<T: Serialize>(&self, key: &str, value: &T, timestamp: DateTime<Utc>) {
        let entry = CacheEntry {
            data: serde_json::to_value(value).unwrap(),
            timestamp,
        };
        self.backend.set(key, entry).await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

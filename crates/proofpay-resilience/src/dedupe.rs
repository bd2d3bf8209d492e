//! Persistent dedupe cache
//!
//! A set of keys with a time-to-live, loaded from a JSON file at start and
//! flushed back on shutdown (or whenever the owner chooses). Expired keys
//! are dropped on load and on flush.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ResilienceError, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    /// key -> time the key was first seen
    entries: HashMap<String, DateTime<Utc>>,
}

/// TTL'd key set
#[derive(Debug)]
pub struct DedupeCache {
    path: Option<PathBuf>,
    ttl: Duration,
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DedupeCache {
    /// Cache that lives only in memory
    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            path: None,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Load a cache from `path`; a missing file yields an empty cache
    pub async fn load(path: impl AsRef<Path>, ttl: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: CacheFile = serde_json::from_slice(&bytes)
                    .map_err(|e| ResilienceError::CacheIo(format!("{}: {e}", path.display())))?;
                file.entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(ResilienceError::CacheIo(format!("{}: {e}", path.display())))
            }
        };

        let cache = Self {
            path: Some(path),
            ttl,
            entries: Mutex::new(entries),
        };
        let dropped = cache.purge_expired(Utc::now());
        info!(
            entries = cache.len(),
            expired = dropped,
            "Dedupe cache loaded"
        );
        Ok(cache)
    }

    /// Record `key` as seen. Returns `true` if it was not already present
    /// (or had expired), `false` for a duplicate.
    pub fn check_and_insert(&self, key: &str) -> bool {
        self.check_and_insert_at(key, Utc::now())
    }

    pub fn check_and_insert_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(seen) if now - *seen < self.ttl => {
                debug!(key = %key, "Duplicate suppressed");
                false
            }
            _ => {
                entries.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Has `key` been seen within the TTL?
    pub fn contains(&self, key: &str) -> bool {
        let now = Utc::now();
        self.entries
            .lock()
            .get(key)
            .is_some_and(|seen| now - *seen < self.ttl)
    }

    /// Forget a key, e.g. after the guarded side effect failed
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Drop expired keys, returning how many were removed
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, seen| now - *seen < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Persist to the backing file through a temp file and rename
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        self.purge_expired(Utc::now());
        let snapshot = CacheFile {
            entries: self.entries.lock().clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| ResilienceError::CacheIo(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ResilienceError::CacheIo(format!("{}: {e}", parent.display())))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ResilienceError::CacheIo(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| ResilienceError::CacheIo(format!("{}: {e}", path.display())))?;
        debug!(entries = snapshot.entries.len(), path = %path.display(), "Dedupe cache flushed");
        Ok(())
    }
}

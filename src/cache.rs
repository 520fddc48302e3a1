//! File-based key/value store with per-entry TTL.
//!
//! Entries are JSON files grouped in category directories. Expiry is checked
//! lazily when an entry is read; there is no background eviction.
//!
//! # Cache Location
//!
//! By default the cache lives in the platform cache directory:
//! - Linux: `~/.cache/imagescan/`
//! - macOS: `~/Library/Caches/imagescan/`
//! - Windows: `%LOCALAPPDATA%\imagescan\cache\`
//!
//! # Example
//!
//! ```no_run
//! use imagescan::Cache;
//! use std::time::Duration;
//!
//! let cache = Cache::new();
//! cache.set("notes", "my_key", &"cached value".to_string(), Duration::from_secs(3600)).unwrap();
//!
//! let value: Option<String> = cache.get("notes", "my_key");
//! assert_eq!(value, Some("cached value".to_string()));
//! ```

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::platform::cache_dir;

/// A stored value with its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone)]
pub struct Cache {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("dir", &self.dir).finish()
    }
}

impl Cache {
    /// Creates a cache in the platform cache directory.
    pub fn new() -> Self {
        Self::at(cache_dir())
    }

    /// Creates a cache rooted at `dir`.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn category_dir(&self, category: &str) -> PathBuf {
        self.dir.join(category)
    }

    /// Converts a cache key to a safe filename.
    fn cache_path(&self, category: &str, key: &str) -> PathBuf {
        let safe_key: String = key
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.category_dir(category)
            .join(format!("{}.json", safe_key))
    }

    fn read_entry<T: DeserializeOwned>(&self, path: &Path, key: &str) -> Option<CacheEntry<T>> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str::<CacheEntry<T>>(&content) {
            // Sanitized filenames can collide; the stored key is authoritative.
            Ok(entry) if entry.key == key => Some(entry),
            Ok(_) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable cache entry");
                None
            }
        }
    }

    /// Retrieves a live value, evicting it if it has expired.
    pub fn get<T: DeserializeOwned>(&self, category: &str, key: &str) -> Option<T> {
        self.get_entry(category, key).map(|entry| entry.value)
    }

    /// Retrieves a live entry, evicting it if it has expired.
    pub fn get_entry<T: DeserializeOwned>(
        &self,
        category: &str,
        key: &str,
    ) -> Option<CacheEntry<T>> {
        let path = self.cache_path(category, key);
        if !path.exists() {
            return None;
        }

        let entry: CacheEntry<T> = self.read_entry(&path, key)?;
        if entry.is_expired(self.clock.now()) {
            debug!(category, key, "cache entry expired");
            let _ = fs::remove_file(&path);
            return None;
        }
        Some(entry)
    }

    /// Like [`get_entry`](Self::get_entry) but never touches the filesystem
    /// beyond reading.
    pub fn peek<T: DeserializeOwned>(&self, category: &str, key: &str) -> Option<CacheEntry<T>> {
        let path = self.cache_path(category, key);
        let entry: CacheEntry<T> = self.read_entry(&path, key)?;
        (!entry.is_expired(self.clock.now())).then_some(entry)
    }

    /// Stores a value that expires after `ttl`.
    pub fn set<T: Serialize>(&self, category: &str, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let dir = self.category_dir(category);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }

        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            cached_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let content = serde_json::to_string(&entry)?;
        fs::write(self.cache_path(category, key), content)?;
        Ok(())
    }

    /// Removes one entry. Returns whether it existed.
    pub fn remove(&self, category: &str, key: &str) -> Result<bool> {
        let path = self.cache_path(category, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists live entries of a category without evicting anything.
    pub fn entries<T: DeserializeOwned>(&self, category: &str) -> Result<Vec<CacheEntry<T>>> {
        let dir = self.category_dir(category);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut entries = Vec::new();
        for file in fs::read_dir(&dir)?.flatten() {
            let path = file.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(entry) = serde_json::from_str::<CacheEntry<T>>(&content) {
                if !entry.is_expired(now) {
                    entries.push(entry);
                }
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Clears all entries of a category.
    pub fn clear(&self, category: &str) -> Result<()> {
        let dir = self.category_dir(category);
        if dir.exists() {
            for entry in fs::read_dir(&dir)?.flatten() {
                let path = entry.path();
                if path.extension().map(|e| e == "json").unwrap_or(false) {
                    let _ = fs::remove_file(path);
                }
            }
        }
        Ok(())
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

//! Per-batch isolation of the scanner's vulnerability-database cache.
//!
//! Scanners keep their database in an on-disk cache guarded by lock files.
//! Concurrent or crashed runs sharing one cache deadlock on those locks or
//! corrupt the database, so every batch gets its own directory. The directory
//! is owned by a [`BatchCacheContext`] guard and removed when the guard drops,
//! whichever way the batch ends.

use chrono::{DateTime, Utc};
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};

pub const DEFAULT_STALE_LOCK_AGE: Duration = Duration::from_secs(10 * 60);

const DIR_PREFIX: &str = "scan_cache_";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct CacheIsolationManager {
    root: PathBuf,
    stale_lock_age: Duration,
    reuse_dir: Option<PathBuf>,
}

impl CacheIsolationManager {
    /// Allocates fresh batch directories under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stale_lock_age: DEFAULT_STALE_LOCK_AGE,
            reuse_dir: None,
        }
    }

    /// Uses one fixed directory for every batch instead of allocating new ones.
    /// The directory survives the batch; stale locks are purged before reuse.
    pub fn reusing(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            root: dir.clone(),
            stale_lock_age: DEFAULT_STALE_LOCK_AGE,
            reuse_dir: Some(dir),
        }
    }

    pub fn with_stale_lock_age(mut self, age: Duration) -> Self {
        self.stale_lock_age = age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Provisions the cache directory for one batch.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::CacheProvision`] when the directory cannot be
    /// created. No scan may run without it.
    pub fn allocate(&self) -> Result<BatchCacheContext> {
        let created_at = Utc::now();

        if let Some(dir) = &self.reuse_dir {
            fs::create_dir_all(dir).map_err(|source| Error::CacheProvision {
                path: dir.clone(),
                source,
            })?;
            let purged = purge_stale_locks(dir, self.stale_lock_age);
            info!(dir = %dir.display(), purged, "reusing scan cache directory");
            return Ok(BatchCacheContext {
                path: dir.clone(),
                created_at,
                stale_lock_age: self.stale_lock_age,
                keep: true,
            });
        }

        fs::create_dir_all(&self.root).map_err(|source| Error::CacheProvision {
            path: self.root.clone(),
            source,
        })?;

        let stamp = created_at.format("%Y%m%dT%H%M%S%3f");
        let pid = std::process::id();
        loop {
            let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
            let path = self
                .root
                .join(format!("{}{}_{}_{}", DIR_PREFIX, stamp, pid, seq));

            // create_dir (not create_dir_all) so two batches can never share a name.
            match fs::create_dir(&path) {
                Ok(()) => {
                    info!(dir = %path.display(), "created isolated scan cache");
                    return Ok(BatchCacheContext {
                        path,
                        created_at,
                        stale_lock_age: self.stale_lock_age,
                        keep: false,
                    });
                }
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => continue,
                Err(source) => return Err(Error::CacheProvision { path, source }),
            }
        }
    }
}

/// Scoped ownership of one batch's cache directory.
#[derive(Debug)]
pub struct BatchCacheContext {
    path: PathBuf,
    created_at: DateTime<Utc>,
    stale_lock_age: Duration,
    keep: bool,
}

impl BatchCacheContext {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_reused(&self) -> bool {
        self.keep
    }

    /// Removes lock files older than the configured age. Returns how many
    /// were removed.
    pub fn purge_stale_locks(&self) -> usize {
        purge_stale_locks(&self.path, self.stale_lock_age)
    }
}

impl Drop for BatchCacheContext {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => info!(dir = %self.path.display(), "removed isolated scan cache"),
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.path.display(), error = %e, "failed to remove scan cache"),
        }
    }
}

/// Deletes `*.lock` files under `dir` whose last modification is older than
/// `max_age`. Such locks are orphans of crashed runs.
pub fn purge_stale_locks(dir: &Path, max_age: Duration) -> usize {
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in WalkDir::new(dir).into_iter().flatten() {
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().map(|e| e != "lock").unwrap_or(true) {
            continue;
        }

        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok());

        match age {
            Some(age) if age > max_age => match fs::remove_file(path) {
                Ok(()) => {
                    info!(lock = %path.display(), age_secs = age.as_secs(), "removed stale lock");
                    removed += 1;
                }
                Err(e) => warn!(lock = %path.display(), error = %e, "failed to remove stale lock"),
            },
            _ => debug!(lock = %path.display(), "lock is fresh, keeping"),
        }
    }

    removed
}

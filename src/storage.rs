//! Persistence of catalog records.
//!
//! The engine only needs to upsert records by id. [`JsonCatalogStore`] keeps
//! the processed catalog as one JSON document:
//!
//! ```json
//! {"version": "1.0", "updated_at": "...", "total_tools": 2, "tools": [ ... ]}
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::ToolRecord;

pub const CATALOG_VERSION: &str = "1.0";

/// Upserts catalog records.
///
/// Implementations serialize their own writes; the orchestrator calls `save`
/// from several workers at once.
#[async_trait]
pub trait ToolStore: Send + Sync {
    /// With `merge`, records are upserted by id and all other records are kept.
    /// Without it the stored catalog is replaced by `tools`.
    async fn save(&self, tools: &[ToolRecord], merge: bool) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    version: String,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    total_tools: usize,
    #[serde(default)]
    tools: Vec<ToolRecord>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl CatalogFile {
    fn empty() -> Self {
        Self {
            version: CATALOG_VERSION.to_string(),
            updated_at: None,
            total_tools: 0,
            tools: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// The processed catalog as a single JSON file.
///
/// Every save is a read-modify-write of the whole file under an exclusive
/// advisory lock on `<catalog>.lock`, so several stores or processes sharing
/// one catalog never lose each other's updates.
#[derive(Debug)]
pub struct JsonCatalogStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonCatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads all records. A missing catalog is empty.
    pub fn load(&self) -> Result<Vec<ToolRecord>> {
        Ok(read_file(&self.path)?.map(|f| f.tools).unwrap_or_default())
    }
}

#[async_trait]
impl ToolStore for JsonCatalogStore {
    async fn save(&self, tools: &[ToolRecord], merge: bool) -> Result<()> {
        // Keeps this store's own writers off the blocking pool while one waits
        // for the file lock.
        let _guard = self.write_lock.lock().await;

        let path = self.path.clone();
        let records = tools.to_vec();
        let total = tokio::task::spawn_blocking(move || save_locked(&path, records, merge))
            .await
            .map_err(|e| Error::Storage {
                path: self.path.clone(),
                source: io::Error::other(e),
            })??;

        if merge {
            debug!(path = %self.path.display(), updated = tools.len(), total, "merged catalog records");
        } else {
            info!(path = %self.path.display(), total, "saved catalog");
        }
        Ok(())
    }
}

fn save_locked(path: &Path, tools: Vec<ToolRecord>, merge: bool) -> Result<usize> {
    let storage_err = |source| Error::Storage {
        path: path.to_path_buf(),
        source,
    };

    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(storage_err)?;
    let _lock = CatalogLock::acquire(path).map_err(storage_err)?;

    let mut file = read_file(path)?.unwrap_or_else(CatalogFile::empty);
    if merge {
        for tool in tools {
            match file.tools.iter_mut().find(|t| t.id == tool.id) {
                Some(existing) => *existing = tool,
                None => file.tools.push(tool),
            }
        }
    } else {
        file.tools = tools;
    }

    if file.version.is_empty() {
        file.version = CATALOG_VERSION.to_string();
    }
    file.updated_at = Some(Utc::now());
    file.total_tools = file.tools.len();

    write_file(path, &file)?;
    Ok(file.total_tools)
}

fn read_file(path: &Path) -> Result<Option<CatalogFile>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(Error::Storage {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let file = serde_json::from_str(&content).map_err(|source| Error::Catalog {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(file))
}

/// Replaces the catalog through a uniquely named temp file in the same
/// directory, so readers only ever see a complete document.
fn write_file(path: &Path, file: &CatalogFile) -> Result<()> {
    let storage_err = |source| Error::Storage {
        path: path.to_path_buf(),
        source,
    };

    let content = serde_json::to_vec_pretty(file).map_err(|source| Error::Catalog {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = NamedTempFile::new_in(parent_dir(path)).map_err(storage_err)?;
    tmp.write_all(&content).map_err(storage_err)?;
    tmp.as_file().sync_all().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Exclusive advisory lock on `<catalog>.lock`, released when dropped.
struct CatalogLock {
    _file: File,
}

impl CatalogLock {
    fn acquire(catalog: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path(catalog))?;
        flock_exclusive(&file)?;
        Ok(Self { _file: file })
    }
}

fn lock_path(catalog: &Path) -> PathBuf {
    let name = catalog
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "catalog".to_string());
    catalog.with_file_name(format!("{name}.lock"))
}

/// Blocks until an exclusive `flock` is held on `file`. The lock belongs to
/// the open file description and is released when `file` is closed.
fn flock_exclusive(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        loop {
            // SAFETY: fd is a valid descriptor owned by `file` for the whole call.
            let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}

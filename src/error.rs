use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the scan engine.
///
/// Per-tool scan failures are not errors: they are reported through
/// [`ScanResult`](crate::model::ScanResult). Only conditions that make a whole
/// operation impossible end up here.
#[derive(Debug, Error)]
pub enum Error {
    /// The isolated scanner cache for a batch could not be created. Batch-fatal.
    #[error("failed to provision isolated scan cache at {path}: {source}")]
    CacheProvision {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog {path}: {source}")]
    Catalog {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cache error: {0}")]
    Cache(#[from] std::io::Error),

    #[error("failed to encode cache entry: {0}")]
    CacheEncode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

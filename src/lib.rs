//! Resilient vulnerability-scan orchestration for container image catalogs.
//!
//! Given catalog records that point at container images, the
//! [`ScanOrchestrator`] picks the image tag to scan, runs an external scanner
//! with bounded concurrency inside a batch-scoped cache directory, classifies
//! failures into retry tiers, remembers failures across runs, and persists
//! each successful result as soon as it is available.

pub mod cache;
pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod invoker;
pub mod isolation;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod platform;
pub mod resolver;
pub mod retry;
pub mod scan_cache;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::Cache;
pub use config::Config;
pub use error::{Error, Result};
pub use invoker::{ScannerInvoker, TrivyScanner, VulnerabilityScanner};
pub use isolation::{BatchCacheContext, CacheIsolationManager};
pub use model::{BatchResult, ErrorKind, ErrorTier, ScanResult, ToolRecord};
pub use orchestrator::{Interrupt, ScanOrchestrator};
pub use storage::{JsonCatalogStore, ToolStore};

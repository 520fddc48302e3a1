mod cli;
mod json;

pub use cli::{print_batch_table, print_cache_table, print_dry_run_table};
pub use json::{print_json, to_json};

use crate::cache::CacheEntry;
use crate::model::{BatchResult, DryRunEntry};
use crate::scan_cache::{FailedScan, Unscannable};
use anyhow::Result;
use serde::Serialize;

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    Table,
    /// JSON format for programmatic use
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown format: {}. Use 'table' or 'json'", s)),
        }
    }
}

/// Snapshot of the scan caches for `cache list`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheReport {
    pub failed_scans: Vec<CacheEntry<FailedScan>>,
    pub unscannable: Vec<CacheEntry<Unscannable>>,
    /// Ids excluded by configuration rather than by a failed scan.
    pub static_unscannable: Vec<String>,
}

pub fn print_batch_result(result: &BatchResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => print_batch_table(result),
        OutputFormat::Json => print_json(result),
    }
}

pub fn print_dry_run(plan: &[DryRunEntry], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => print_dry_run_table(plan),
        OutputFormat::Json => print_json(plan),
    }
}

pub fn print_cache_report(report: &CacheReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => print_cache_table(report),
        OutputFormat::Json => print_json(report),
    }
}

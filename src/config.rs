//! Configuration file handling.
//!
//! This module provides loading and saving of imagescan configuration
//! from a TOML file.
//!
//! # Configuration Location
//!
//! The configuration file is stored at:
//! - Linux: `~/.config/imagescan/config.toml`
//! - macOS: `~/Library/Application Support/imagescan/config.toml`
//! - Windows: `%APPDATA%\imagescan\config.toml`
//!
//! # Example Configuration
//!
//! ```toml
//! default_format = "table"
//! catalog_file = "/srv/catalog/processed/tools.json"
//!
//! [scan]
//! default_tag = "latest"
//! timeout_secs = 300
//! concurrency = 1
//! staleness_days = 7
//! max_attempts = 4
//! unscannable_images = ["docker_hub:library/scratch"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::platform;
use crate::retry::RetryPolicy;

/// Application configuration.
///
/// Missing keys fall back to their defaults, so a partial file is valid.
///
/// # Example
///
/// ```no_run
/// use imagescan::Config;
///
/// let config = Config::load().unwrap();
///
/// println!("Catalog: {}", config.catalog_path().display());
/// println!("Concurrency: {}", config.scan.concurrency);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for the catalog and the scan caches.
    ///
    /// Default: the platform data directory (`~/.local/share/imagescan` on Linux)
    pub data_dir: Option<PathBuf>,

    /// Processed catalog file.
    ///
    /// Default: `<data_dir>/processed/tools.json`
    pub catalog_file: Option<PathBuf>,

    /// Directory under which per-batch scanner caches are created.
    ///
    /// Default: `<cache_dir>/scanner`
    pub scan_cache_root: Option<PathBuf>,

    /// Default output format when no `--format` flag is provided.
    ///
    /// Valid values: "table", "json"
    /// Default: "table"
    pub default_format: String,

    pub scan: ScanSettings,
}

/// Scan engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Tag used when a record has no tag data.
    pub default_tag: String,

    /// Per-process timeout, in seconds.
    pub timeout_secs: u64,

    /// Maximum number of scans in flight.
    ///
    /// Default: 1. Scanners serialize on their vulnerability database, so more
    /// workers mostly add lock contention.
    pub concurrency: usize,

    /// Age after which a successful scan is due again, in days.
    pub staleness_days: u64,

    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    /// Total attempts per tool and run, including the first.
    pub max_attempts: u32,

    /// Random spread applied to each backoff wait (0.2 = ±20%).
    pub jitter_ratio: f64,

    /// How long a transient or infrastructure failure suppresses rescans.
    pub failed_scan_ttl_secs: u64,

    /// How long a permanent failure suppresses rescans.
    pub unscannable_ttl_secs: u64,

    /// Lock files older than this are removed from a reused cache directory.
    pub stale_lock_secs: u64,

    /// Try a registry-only scan before pulling the image.
    pub try_remote_first: bool,

    pub scanner_path: PathBuf,
    pub docker_path: PathBuf,

    /// Tool ids that are never scanned.
    pub unscannable_images: Vec<String>,

    /// Infrastructure failures (across runs) after which a tool is treated as
    /// unscannable. Unset means never.
    pub infrastructure_escalation_threshold: Option<u32>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            default_tag: "latest".to_string(),
            timeout_secs: 300,
            concurrency: 1,
            staleness_days: 7,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 8000,
            max_attempts: 4,
            jitter_ratio: 0.2,
            failed_scan_ttl_secs: 3600,
            unscannable_ttl_secs: 7 * 24 * 3600,
            stale_lock_secs: 600,
            try_remote_first: true,
            scanner_path: PathBuf::from("trivy"),
            docker_path: PathBuf::from("docker"),
            unscannable_images: vec!["docker_hub:library/scratch".to_string()],
            infrastructure_escalation_threshold: None,
        }
    }
}

impl ScanSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_days * 24 * 3600)
    }

    pub fn failed_scan_ttl(&self) -> Duration {
        Duration::from_secs(self.failed_scan_ttl_secs)
    }

    pub fn unscannable_ttl(&self) -> Duration {
        Duration::from_secs(self.unscannable_ttl_secs)
    }

    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            max_attempts: self.max_attempts.max(1),
            jitter_ratio: self.jitter_ratio.clamp(0.0, 1.0),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            catalog_file: None,
            scan_cache_root: None,
            default_format: "table".to_string(),
            scan: ScanSettings::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the config file.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Saves the configuration to the config file.
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Returns the path to the configuration file.
    ///
    /// # Example
    ///
    /// ```
    /// use imagescan::Config;
    ///
    /// let path = Config::config_path();
    /// assert!(path.ends_with("imagescan/config.toml"));
    /// ```
    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    pub fn data_path(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(platform::data_dir)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_file
            .clone()
            .unwrap_or_else(|| self.data_path().join("processed").join("tools.json"))
    }

    /// Where the failed-scan cache and unscannable registry live.
    pub fn scan_state_dir(&self) -> PathBuf {
        self.data_path().join("cache")
    }

    pub fn scan_cache_root(&self) -> PathBuf {
        self.scan_cache_root
            .clone()
            .unwrap_or_else(platform::scan_cache_root)
    }

    /// Generates a string containing the default configuration.
    pub fn generate_default_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

//! Memoized scan failures.
//!
//! Two independent TTL stores keyed by tool id:
//!
//! - [`FailedScanCache`]: short-lived record of transient or infrastructure
//!   failures so the next run does not immediately hammer the same image.
//! - [`UnscannableRegistry`]: long-lived record of images that cannot succeed
//!   (missing image or manifest, no access, unsupported format).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::{Cache, CacheEntry};
use crate::error::Result;
use crate::model::ErrorKind;

pub const FAILED_CATEGORY: &str = "security_scan_failures";
pub const UNSCANNABLE_CATEGORY: &str = "unscannable_images";
pub const STRIKES_CATEGORY: &str = "infrastructure_strikes";

pub const DEFAULT_FAILED_SCAN_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_UNSCANNABLE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedScan {
    pub error_type: ErrorKind,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unscannable {
    pub error_type: Option<ErrorKind>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct FailedScanCache {
    cache: Cache,
    ttl: Duration,
}

impl FailedScanCache {
    pub fn new(cache: Cache, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn mark_failed(&self, tool_id: &str, error_type: ErrorKind, error: &str) -> Result<()> {
        debug!(tool_id, %error_type, ttl_secs = self.ttl.as_secs(), "caching failed scan");
        let record = FailedScan {
            error_type,
            error: error.to_string(),
        };
        self.cache.set(FAILED_CATEGORY, tool_id, &record, self.ttl)
    }

    /// Checks for a live failure, evicting it if expired.
    pub fn is_failed(&self, tool_id: &str) -> bool {
        self.cache
            .get::<FailedScan>(FAILED_CATEGORY, tool_id)
            .is_some()
    }

    /// Checks for a live failure without evicting anything.
    pub fn peek_failed(&self, tool_id: &str) -> bool {
        self.cache
            .peek::<FailedScan>(FAILED_CATEGORY, tool_id)
            .is_some()
    }

    pub fn failure(&self, tool_id: &str) -> Option<CacheEntry<FailedScan>> {
        self.cache.get_entry(FAILED_CATEGORY, tool_id)
    }

    pub fn clear_failure(&self, tool_id: &str) -> Result<bool> {
        self.cache.remove(FAILED_CATEGORY, tool_id)
    }

    pub fn entries(&self) -> Result<Vec<CacheEntry<FailedScan>>> {
        self.cache.entries(FAILED_CATEGORY)
    }

    pub fn clear_all(&self) -> Result<()> {
        self.cache.clear(FAILED_CATEGORY)
    }
}

#[derive(Debug, Clone)]
pub struct UnscannableRegistry {
    cache: Cache,
    ttl: Duration,
    static_ids: HashSet<String>,
}

impl UnscannableRegistry {
    pub fn new(cache: Cache, ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            static_ids: HashSet::new(),
        }
    }

    /// Ids that can never be scanned (virtual base images and the like).
    pub fn with_static_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.static_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn mark_unscannable(
        &self,
        tool_id: &str,
        error_type: Option<ErrorKind>,
        reason: &str,
    ) -> Result<()> {
        info!(tool_id, reason, "marking image as unscannable");
        let record = Unscannable {
            error_type,
            reason: reason.to_string(),
        };
        self.cache.set(UNSCANNABLE_CATEGORY, tool_id, &record, self.ttl)
    }

    pub fn is_unscannable(&self, tool_id: &str) -> bool {
        self.static_ids.contains(tool_id)
            || self
                .cache
                .get::<Unscannable>(UNSCANNABLE_CATEGORY, tool_id)
                .is_some()
    }

    pub fn peek_unscannable(&self, tool_id: &str) -> bool {
        self.static_ids.contains(tool_id)
            || self
                .cache
                .peek::<Unscannable>(UNSCANNABLE_CATEGORY, tool_id)
                .is_some()
    }

    pub fn info(&self, tool_id: &str) -> Option<CacheEntry<Unscannable>> {
        self.cache.get_entry(UNSCANNABLE_CATEGORY, tool_id)
    }

    /// Removes a recorded marking and any infrastructure strikes. Static ids
    /// stay unscannable.
    pub fn clear_unscannable(&self, tool_id: &str) -> Result<bool> {
        self.cache.remove(STRIKES_CATEGORY, tool_id)?;
        self.cache.remove(UNSCANNABLE_CATEGORY, tool_id)
    }

    pub fn entries(&self) -> Result<Vec<CacheEntry<Unscannable>>> {
        self.cache.entries(UNSCANNABLE_CATEGORY)
    }

    pub fn clear_all(&self) -> Result<()> {
        self.cache.clear(STRIKES_CATEGORY)?;
        self.cache.clear(UNSCANNABLE_CATEGORY)
    }

    /// Counts one more infrastructure failure for a tool across runs and
    /// returns the running total. Strikes live as long as registry entries.
    pub fn record_infrastructure_strike(&self, tool_id: &str) -> Result<u32> {
        let strikes = self
            .cache
            .get::<u32>(STRIKES_CATEGORY, tool_id)
            .unwrap_or(0)
            + 1;
        self.cache.set(STRIKES_CATEGORY, tool_id, &strikes, self.ttl)?;
        Ok(strikes)
    }
}

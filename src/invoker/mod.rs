//! External scanner invocation.
//!
//! [`VulnerabilityScanner`] is the seam between the orchestration logic and
//! the actual scanner process. [`TrivyScanner`] shells out; tests substitute
//! canned outcomes. [`ScannerInvoker`] turns one scanner call (or two, with the
//! local fallback) into a classified [`AttemptOutcome`].

mod report;
mod trivy;

pub use report::parse_report;
pub use trivy::TrivyScanner;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::classify::classify_attempt;
use crate::isolation::BatchCacheContext;
use crate::model::{ErrorKind, ErrorTier, ScanAttempt, ScanStrategy, Vulnerabilities};

/// Default per-process timeout.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(300);

/// Executes one scan of one image.
///
/// Implementations never fail: spawn errors, timeouts and non-zero exits are
/// all reported inside the returned [`ScanAttempt`].
#[async_trait]
pub trait VulnerabilityScanner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn scan(
        &self,
        image_ref: &str,
        strategy: ScanStrategy,
        cache_dir: &Path,
        timeout: Duration,
    ) -> ScanAttempt;
}

/// Result of one attempt after strategy fallback and output parsing.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Success {
        vulnerabilities: Vulnerabilities,
        attempt: ScanAttempt,
    },
    Failure {
        kind: ErrorKind,
        attempt: ScanAttempt,
    },
}

pub struct ScannerInvoker {
    scanner: Arc<dyn VulnerabilityScanner>,
    timeout: Duration,
    try_remote_first: bool,
}

impl std::fmt::Debug for ScannerInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScannerInvoker")
            .field("scanner", &self.scanner.name())
            .field("timeout", &self.timeout)
            .field("try_remote_first", &self.try_remote_first)
            .finish()
    }
}

impl ScannerInvoker {
    pub fn new(scanner: Arc<dyn VulnerabilityScanner>) -> Self {
        Self {
            scanner,
            timeout: DEFAULT_SCAN_TIMEOUT,
            try_remote_first: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_remote_first(mut self, enabled: bool) -> Self {
        self.try_remote_first = enabled;
        self
    }

    pub fn scanner_name(&self) -> &'static str {
        self.scanner.name()
    }

    /// Runs one attempt: remote first, then a local pull-and-scan if the remote
    /// failure might be specific to remote access.
    pub async fn attempt(&self, image_ref: &str, cache: &BatchCacheContext) -> AttemptOutcome {
        if self.try_remote_first {
            let remote = self.run(image_ref, ScanStrategy::Remote, cache).await;
            match &remote {
                AttemptOutcome::Success { .. } => return remote,
                AttemptOutcome::Failure { kind, .. } if kind.tier() == ErrorTier::Permanent => {
                    return remote;
                }
                AttemptOutcome::Failure { kind, .. } => {
                    debug!(%image_ref, error_type = %kind, "remote scan failed, falling back to local");
                }
            }
        }

        self.run(image_ref, ScanStrategy::Local, cache).await
    }

    async fn run(
        &self,
        image_ref: &str,
        strategy: ScanStrategy,
        cache: &BatchCacheContext,
    ) -> AttemptOutcome {
        let attempt = self
            .scanner
            .scan(image_ref, strategy, cache.path(), self.timeout)
            .await;

        if attempt.is_success() {
            return match parse_report(&attempt.stdout) {
                Ok(vulnerabilities) => AttemptOutcome::Success {
                    vulnerabilities,
                    attempt,
                },
                Err(e) => {
                    warn!(%image_ref, %strategy, error = %e, "unparseable scanner output");
                    AttemptOutcome::Failure {
                        kind: ErrorKind::ScannerCrash,
                        attempt,
                    }
                }
            };
        }

        let kind = classify_attempt(&attempt);
        debug!(
            %image_ref,
            %strategy,
            exit = ?attempt.exit_status,
            error_type = %kind,
            "scan attempt failed"
        );
        if kind == ErrorKind::CacheLock {
            let purged = cache.purge_stale_locks();
            debug!(purged, "purged stale locks after cache lock error");
        }
        AttemptOutcome::Failure { kind, attempt }
    }
}

/// The tag part of an image reference. Digest references have no tag.
///
/// ```
/// use imagescan::invoker::scanned_tag;
///
/// assert_eq!(scanned_tag("postgres:stable").as_deref(), Some("stable"));
/// assert_eq!(scanned_tag("localhost:5000/app:1.2").as_deref(), Some("1.2"));
/// assert_eq!(scanned_tag("postgres@sha256:abc"), None);
/// ```
pub fn scanned_tag(image_ref: &str) -> Option<String> {
    if image_ref.contains('@') {
        return None;
    }
    let last_segment = image_ref.rsplit('/').next().unwrap_or(image_ref);
    last_segment
        .split_once(':')
        .map(|(_, tag)| tag.to_string())
}

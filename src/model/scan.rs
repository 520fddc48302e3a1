use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{SecurityStatus, Vulnerabilities};

/// Immutable input to image resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub tool_id: String,
    pub candidate_tags: Vec<String>,
    pub fallback_tag: String,
}

/// An image reference selected for scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedImage {
    pub image_ref: String,
    pub selected_tag: String,
}

/// How the scanner obtains the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStrategy {
    /// Scanner reads image layers straight from the registry.
    Remote,
    /// Image is pulled into the local daemon first, then scanned.
    Local,
}

impl std::fmt::Display for ScanStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanStrategy::Remote => write!(f, "remote"),
            ScanStrategy::Local => write!(f, "local"),
        }
    }
}

/// Which process of an attempt produced the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStage {
    Pull,
    Scan,
}

/// Raw outcome of one external process invocation.
#[derive(Debug, Clone)]
pub struct ScanAttempt {
    pub image_ref: String,
    pub strategy: ScanStrategy,
    pub stage: AttemptStage,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// `None` when the process never exited on its own (spawn error, timeout kill).
    pub exit_status: Option<i32>,
    pub raw_diagnostic_text: String,
    pub stdout: String,
    pub timed_out: bool,
    pub spawn_error: Option<String>,
}

impl ScanAttempt {
    pub fn is_success(&self) -> bool {
        self.exit_status == Some(0) && !self.timed_out && self.spawn_error.is_none()
    }
}

/// Coarse failure category driving retry and caching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorTier {
    Transient,
    Permanent,
    Infrastructure,
}

impl std::fmt::Display for ErrorTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorTier::Transient => write!(f, "transient"),
            ErrorTier::Permanent => write!(f, "permanent"),
            ErrorTier::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkTimeout,
    RateLimit,
    CacheLock,
    ImageNotFound,
    ManifestUnknown,
    UnscannableImage,
    Unauthorized,
    ScannerCrash,
    PullFailed,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::CacheLock => "cache_lock",
            ErrorKind::ImageNotFound => "image_not_found",
            ErrorKind::ManifestUnknown => "manifest_unknown",
            ErrorKind::UnscannableImage => "unscannable_image",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::ScannerCrash => "scanner_crash",
            ErrorKind::PullFailed => "pull_failed",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Tier of the first occurrence of this kind.
    pub fn tier(&self) -> ErrorTier {
        self.tier_on_occurrence(1)
    }

    /// Tier of the `occurrence`-th consecutive failure of this kind.
    ///
    /// Only `Unknown` depends on the occurrence: it gets one retry, then it is
    /// treated as permanent.
    pub fn tier_on_occurrence(&self, occurrence: u32) -> ErrorTier {
        match self {
            ErrorKind::NetworkTimeout | ErrorKind::RateLimit | ErrorKind::CacheLock => {
                ErrorTier::Transient
            }
            ErrorKind::ImageNotFound
            | ErrorKind::ManifestUnknown
            | ErrorKind::UnscannableImage
            | ErrorKind::Unauthorized => ErrorTier::Permanent,
            ErrorKind::ScannerCrash | ErrorKind::PullFailed => ErrorTier::Infrastructure,
            ErrorKind::Unknown if occurrence <= 1 => ErrorTier::Transient,
            ErrorKind::Unknown => ErrorTier::Permanent,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal outcome of one tool's scan lifecycle, after all retries.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub success: bool,
    pub image_ref: String,
    pub vulnerabilities: Option<Vulnerabilities>,
    pub scanned_tag: Option<String>,
    pub error_type: Option<ErrorKind>,
    pub error: Option<String>,
    pub retry_count: u32,
    #[serde(with = "duration_secs")]
    pub scan_duration: Duration,
    pub scanned_at: DateTime<Utc>,
}

/// Per-tool lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Pending,
    Attempting,
    Retry,
    SkippedCached,
    SkippedUnscannable,
    SkippedUpToDate,
    SkippedNotApplicable,
    Succeeded,
    FailedPermanent,
    FailedExhausted,
}

impl ToolState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ToolState::Pending | ToolState::Attempting | ToolState::Retry
        )
    }

    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            ToolState::SkippedCached | ToolState::SkippedUnscannable
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ToolState::FailedPermanent | ToolState::FailedExhausted
        )
    }

    /// Whether a tool in this state may move to `next`.
    ///
    /// Skips only happen before the first attempt; every attempt ends in a
    /// retry or a terminal state.
    pub fn can_advance_to(&self, next: ToolState) -> bool {
        match (self, next) {
            (ToolState::Pending, ToolState::Attempting) => true,
            (ToolState::Pending, next) => {
                next.is_skip()
                    || matches!(
                        next,
                        ToolState::SkippedUpToDate | ToolState::SkippedNotApplicable
                    )
            }
            (ToolState::Attempting, next) => {
                matches!(next, ToolState::Retry | ToolState::Succeeded) || next.is_failure()
            }
            (ToolState::Retry, ToolState::Attempting) => true,
            _ => false,
        }
    }
}

/// What happened to one tool in a batch.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
    pub tool_id: String,
    pub state: ToolState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ScanResult>,
    pub persisted: bool,
}

/// Snapshot handed to the progress callback whenever a tool starts an
/// attempt, backs off for a retry, or reaches its terminal state.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Tools that have reached a terminal state so far.
    pub completed: usize,
    pub total: usize,
    pub tool_id: String,
    pub state: ToolState,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    /// Tools taken off the queue and driven to a terminal state.
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Tools not due for a scan (fresh result or not an image source).
    pub up_to_date: usize,
    /// Tools left in the queue because the batch was interrupted.
    pub not_dispatched: usize,
    pub persist_errors: usize,
    pub interrupted: bool,
    pub vulnerability_totals: Vulnerabilities,
    pub failures: BTreeMap<String, ErrorKind>,
    pub outcomes: Vec<ToolOutcome>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl BatchResult {
    /// Failed tool ids grouped by their classification.
    pub fn failures_by_kind(&self) -> BTreeMap<ErrorKind, Vec<String>> {
        let mut grouped: BTreeMap<ErrorKind, Vec<String>> = BTreeMap::new();
        for (tool_id, kind) in &self.failures {
            grouped.entry(*kind).or_default().push(tool_id.clone());
        }
        grouped
    }

    pub(crate) fn record(&mut self, outcome: ToolOutcome) {
        debug_assert!(outcome.state.is_terminal(), "recorded a non-terminal outcome");
        match outcome.state {
            ToolState::Succeeded => {
                self.succeeded += 1;
                if let Some(vulns) = outcome.result.as_ref().and_then(|r| r.vulnerabilities) {
                    self.vulnerability_totals.accumulate(&vulns);
                }
                if !outcome.persisted {
                    self.persist_errors += 1;
                }
            }
            state if state.is_failure() => {
                self.failed += 1;
                let kind = outcome
                    .result
                    .as_ref()
                    .and_then(|r| r.error_type)
                    .unwrap_or(ErrorKind::Unknown);
                self.failures.insert(outcome.tool_id.clone(), kind);
            }
            state if state.is_skip() => self.skipped += 1,
            ToolState::SkippedUpToDate | ToolState::SkippedNotApplicable => {
                // Not worth an outcome line; most of a catalog lands here.
                self.up_to_date += 1;
                return;
            }
            _ => {}
        }
        self.outcomes.push(outcome);
    }
}

/// One line of a dry-run plan.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunEntry {
    pub tool_id: String,
    pub would_scan_image_ref: String,
    pub current_status: SecurityStatus,
    #[serde(with = "duration_secs::option")]
    pub last_scan_age: Option<Duration>,
}

/// Serializes durations as fractional seconds.
pub(crate) mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub mod option {
        use serde::Serializer;
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&d.as_secs_f64()),
                None => serializer.serialize_none(),
            }
        }
    }
}

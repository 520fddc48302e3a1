//! Batch scan orchestration.
//!
//! [`ScanOrchestrator`] drives every tool of a batch through its lifecycle:
//!
//! ```text
//! PENDING -> SKIPPED_UP_TO_DATE | SKIPPED_NOT_APPLICABLE
//!         -> SKIPPED_UNSCANNABLE | SKIPPED_CACHED
//!         -> ATTEMPTING -> (RETRY -> ATTEMPTING)* -> SUCCEEDED | FAILED_PERMANENT | FAILED_EXHAUSTED
//! ```
//!
//! A fixed number of workers pull tools from a shared queue, so at most
//! `concurrency` scans are in flight. Successful results are persisted as soon
//! as each tool finishes; failures only touch the scan caches.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::error::Result;
use crate::invoker::{scanned_tag, AttemptOutcome, ScannerInvoker};
use crate::isolation::{BatchCacheContext, CacheIsolationManager};
use crate::model::{
    BatchResult, DryRunEntry, ErrorKind, ErrorTier, Progress, ResolvedImage, ScanAttempt,
    ScanResult, SecurityStatus, ToolOutcome, ToolRecord, ToolState,
};
use crate::resolver::ImageResolver;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::scan_cache::{FailedScanCache, UnscannableRegistry};
use crate::storage::ToolStore;

/// Default age after which a successful scan is due again.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(7 * 24 * 3600);

const MAX_ERROR_LEN: usize = 500;

/// Cooperative stop signal for a running batch.
///
/// Once triggered, workers stop taking new tools; scans already in flight run
/// to completion and are persisted as usual.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ScanOrchestrator {
    resolver: ImageResolver,
    invoker: ScannerInvoker,
    store: Arc<dyn ToolStore>,
    isolation: CacheIsolationManager,
    failed: FailedScanCache,
    registry: UnscannableRegistry,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    staleness: Duration,
    escalation_threshold: Option<u32>,
    interrupt: Interrupt,
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("resolver", &self.resolver)
            .field("invoker", &self.invoker)
            .field("isolation", &self.isolation)
            .field("retry", &self.retry)
            .field("staleness", &self.staleness)
            .field("escalation_threshold", &self.escalation_threshold)
            .finish_non_exhaustive()
    }
}

impl ScanOrchestrator {
    pub fn new(
        invoker: ScannerInvoker,
        store: Arc<dyn ToolStore>,
        isolation: CacheIsolationManager,
        failed: FailedScanCache,
        registry: UnscannableRegistry,
    ) -> Self {
        Self {
            resolver: ImageResolver::default(),
            invoker,
            store,
            isolation,
            failed,
            registry,
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            staleness: DEFAULT_STALENESS,
            escalation_threshold: None,
            interrupt: Interrupt::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: ImageResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Number of infrastructure failures, counted across runs, after which a
    /// tool is moved to the unscannable registry. `None` never escalates.
    pub fn with_escalation_threshold(mut self, threshold: Option<u32>) -> Self {
        self.escalation_threshold = threshold;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Handle for stopping a running batch.
    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    pub fn failed_cache(&self) -> &FailedScanCache {
        &self.failed
    }

    pub fn registry(&self) -> &UnscannableRegistry {
        &self.registry
    }

    pub fn resolve(&self, tool: &ToolRecord) -> Option<ResolvedImage> {
        self.resolver.resolve(tool)
    }

    /// Whether a tool is due for a scan: it is a container image and has
    /// never been scanned, has unknown status, or was scanned longer ago than
    /// the staleness window. `force` makes every container image due.
    pub fn needs_scan(&self, tool: &ToolRecord, force: bool) -> bool {
        if !tool.source().is_scannable() {
            return false;
        }
        if force {
            return true;
        }
        match tool.security.trivy_scan_date {
            None => true,
            Some(_) if tool.security.status == SecurityStatus::Unknown => true,
            Some(date) => self.age(date) > self.staleness,
        }
    }

    /// Tools that would be dispatched to the scanner, in catalog order.
    ///
    /// Consults the scan caches without evicting expired entries.
    pub fn select_for_scan<'a>(&self, tools: &'a [ToolRecord], force: bool) -> Vec<&'a ToolRecord> {
        tools
            .iter()
            .filter(|tool| self.needs_scan(tool, force))
            .filter(|tool| !self.registry.peek_unscannable(&tool.id))
            .filter(|tool| force || !self.failed.peek_failed(&tool.id))
            .collect()
    }

    /// Describes what [`scan_batch`](Self::scan_batch) would do without
    /// running a scanner or modifying any cache.
    pub fn dry_run(&self, tools: &[ToolRecord], force: bool) -> Vec<DryRunEntry> {
        self.select_for_scan(tools, force)
            .into_iter()
            .filter_map(|tool| {
                let image = self.resolver.resolve(tool)?;
                Some(DryRunEntry {
                    tool_id: tool.id.clone(),
                    would_scan_image_ref: image.image_ref,
                    current_status: tool.security.status,
                    last_scan_age: tool.security.trivy_scan_date.map(|d| self.age(d)),
                })
            })
            .collect()
    }

    /// Scans a batch of tools with at most `concurrency` scans in flight.
    ///
    /// Per-tool failures are reported in the returned [`BatchResult`]; the only
    /// error is failing to provision the isolated scanner cache, in which case
    /// nothing is scanned.
    pub async fn scan_batch<F>(
        &self,
        tools: &[ToolRecord],
        concurrency: usize,
        force: bool,
        on_progress: F,
    ) -> Result<BatchResult>
    where
        F: Fn(&Progress) + Sync,
    {
        let started = Instant::now();
        let workers = concurrency.max(1);
        let cache = self.isolation.allocate()?;

        info!(
            tools = tools.len(),
            concurrency = workers,
            cache_dir = %cache.path().display(),
            scanner = self.invoker.scanner_name(),
            force,
            "starting scan batch"
        );

        let queue = Mutex::new(tools.iter());
        let result = Mutex::new(BatchResult::default());
        let completed = AtomicUsize::new(0);

        let worker = |id: usize| {
            let queue = &queue;
            let result = &result;
            let completed = &completed;
            let cache = &cache;
            let on_progress = &on_progress;
            async move {
                loop {
                    if self.interrupt.is_triggered() {
                        debug!(worker = id, "interrupted, worker stopping");
                        break;
                    }
                    let Some(tool) = queue.lock().await.next() else {
                        break;
                    };

                    let report = |state| {
                        on_progress(&Progress {
                            completed: completed.load(Ordering::SeqCst),
                            total: tools.len(),
                            tool_id: tool.id.clone(),
                            state,
                        })
                    };
                    let outcome = self.process(tool, force, cache, &report).await;
                    let progress = Progress {
                        completed: completed.fetch_add(1, Ordering::SeqCst) + 1,
                        total: tools.len(),
                        tool_id: outcome.tool_id.clone(),
                        state: outcome.state,
                    };
                    result.lock().await.record(outcome);
                    on_progress(&progress);
                }
            }
        };

        join_all((0..workers).map(worker)).await;

        let mut batch = result.into_inner();
        batch.total = completed.into_inner();
        batch.not_dispatched = queue.into_inner().len();
        batch.interrupted = batch.not_dispatched > 0;
        batch.duration = started.elapsed();

        // The pool has drained; nothing uses the directory anymore.
        drop(cache);

        if batch.interrupted {
            warn!(
                not_dispatched = batch.not_dispatched,
                "batch interrupted before all tools were dispatched"
            );
        }
        info!(
            succeeded = batch.succeeded,
            failed = batch.failed,
            skipped = batch.skipped,
            up_to_date = batch.up_to_date,
            persist_errors = batch.persist_errors,
            duration_secs = batch.duration.as_secs_f64(),
            "scan batch finished"
        );
        Ok(batch)
    }

    async fn process(
        &self,
        tool: &ToolRecord,
        force: bool,
        cache: &BatchCacheContext,
        report: &(dyn Fn(ToolState) + Sync),
    ) -> ToolOutcome {
        let mut lifecycle = Lifecycle::new(&tool.id, report);
        let outcome = self.drive(tool, force, cache, &mut lifecycle).await;
        lifecycle.advance(outcome.state);
        outcome
    }

    async fn drive(
        &self,
        tool: &ToolRecord,
        force: bool,
        cache: &BatchCacheContext,
        lifecycle: &mut Lifecycle<'_>,
    ) -> ToolOutcome {
        let skip = |state| ToolOutcome {
            tool_id: tool.id.clone(),
            state,
            result: None,
            persisted: false,
        };

        if !tool.source().is_scannable() {
            return skip(ToolState::SkippedNotApplicable);
        }
        if !self.needs_scan(tool, force) {
            return skip(ToolState::SkippedUpToDate);
        }
        if self.registry.is_unscannable(&tool.id) {
            debug!(tool_id = %tool.id, "skipping unscannable image");
            return skip(ToolState::SkippedUnscannable);
        }
        if force {
            if let Err(e) = self.failed.clear_failure(&tool.id) {
                warn!(tool_id = %tool.id, error = %e, "failed to clear cached failure");
            }
        } else if self.failed.is_failed(&tool.id) {
            debug!(tool_id = %tool.id, "skipping recently failed scan");
            return skip(ToolState::SkippedCached);
        }

        let Some(image) = self.resolver.resolve(tool) else {
            return skip(ToolState::SkippedNotApplicable);
        };

        let (state, result) = self
            .scan_with_retries(&tool.id, &image, cache, lifecycle)
            .await;

        let persisted = if state == ToolState::Succeeded {
            self.persist(tool, &result).await
        } else {
            false
        };

        ToolOutcome {
            tool_id: tool.id.clone(),
            state,
            result: Some(result),
            persisted,
        }
    }

    async fn scan_with_retries(
        &self,
        tool_id: &str,
        image: &ResolvedImage,
        cache: &BatchCacheContext,
        lifecycle: &mut Lifecycle<'_>,
    ) -> (ToolState, ScanResult) {
        let started = Instant::now();
        let mut attempt_no = 0u32;
        let mut unknown_streak = 0u32;

        loop {
            attempt_no += 1;
            lifecycle.advance(ToolState::Attempting);
            debug!(tool_id, image_ref = %image.image_ref, attempt = attempt_no, "scanning");

            let (kind, attempt) = match self.invoker.attempt(&image.image_ref, cache).await {
                AttemptOutcome::Success {
                    vulnerabilities, ..
                } => {
                    info!(
                        tool_id,
                        image_ref = %image.image_ref,
                        critical = vulnerabilities.critical,
                        high = vulnerabilities.high,
                        "scan succeeded"
                    );
                    let result = ScanResult {
                        success: true,
                        image_ref: image.image_ref.clone(),
                        vulnerabilities: Some(vulnerabilities),
                        scanned_tag: scanned_tag(&image.image_ref),
                        error_type: None,
                        error: None,
                        retry_count: attempt_no - 1,
                        scan_duration: started.elapsed(),
                        scanned_at: self.clock.now(),
                    };
                    return (ToolState::Succeeded, result);
                }
                AttemptOutcome::Failure { kind, attempt } => (kind, attempt),
            };

            unknown_streak = if kind == ErrorKind::Unknown {
                unknown_streak + 1
            } else {
                0
            };
            let tier = kind.tier_on_occurrence(unknown_streak);

            if let RetryDecision::Retry { wait } = self.retry.decide(tier, attempt_no) {
                info!(
                    tool_id,
                    error_type = %kind,
                    attempt = attempt_no,
                    wait_ms = wait.as_millis() as u64,
                    "transient failure, retrying"
                );
                lifecycle.advance(ToolState::Retry);
                self.sleeper.sleep(wait).await;
                continue;
            }

            let state = if tier == ErrorTier::Transient {
                ToolState::FailedExhausted
            } else {
                ToolState::FailedPermanent
            };
            // A scan that keeps hitting the timeout is treated as a hung scanner.
            let (kind, tier) = if attempt.timed_out && tier == ErrorTier::Transient {
                (ErrorKind::ScannerCrash, ErrorTier::Infrastructure)
            } else {
                (kind, tier)
            };
            let message = failure_message(&attempt);

            warn!(
                tool_id,
                image_ref = %image.image_ref,
                error_type = %kind,
                %tier,
                attempts = attempt_no,
                error = %message,
                "scan failed"
            );
            self.record_failure(tool_id, kind, tier, &message);

            let result = ScanResult {
                success: false,
                image_ref: image.image_ref.clone(),
                vulnerabilities: None,
                scanned_tag: None,
                error_type: Some(kind),
                error: Some(message),
                retry_count: attempt_no - 1,
                scan_duration: started.elapsed(),
                scanned_at: self.clock.now(),
            };
            return (state, result);
        }
    }

    fn record_failure(&self, tool_id: &str, kind: ErrorKind, tier: ErrorTier, message: &str) {
        let recorded = match tier {
            ErrorTier::Permanent if kind != ErrorKind::Unknown => {
                self.registry.mark_unscannable(tool_id, Some(kind), message)
            }
            ErrorTier::Infrastructure => self
                .failed
                .mark_failed(tool_id, kind, message)
                .and_then(|()| self.escalate(tool_id, kind, message)),
            _ => self.failed.mark_failed(tool_id, kind, message),
        };
        if let Err(e) = recorded {
            warn!(tool_id, error = %e, "failed to record scan failure");
        }
    }

    fn escalate(&self, tool_id: &str, kind: ErrorKind, message: &str) -> Result<()> {
        let Some(threshold) = self.escalation_threshold else {
            return Ok(());
        };
        let strikes = self.registry.record_infrastructure_strike(tool_id)?;
        if strikes < threshold {
            debug!(tool_id, strikes, threshold, "infrastructure failure recorded");
            return Ok(());
        }
        let reason = format!("{strikes} infrastructure failures: {message}");
        self.registry.mark_unscannable(tool_id, Some(kind), &reason)
    }

    async fn persist(&self, tool: &ToolRecord, result: &ScanResult) -> bool {
        let Some(vulnerabilities) = result.vulnerabilities else {
            return false;
        };
        let updated =
            tool.with_scan_outcome(vulnerabilities, result.scanned_tag.clone(), result.scanned_at);

        match self.store.save(std::slice::from_ref(&updated), true).await {
            Ok(()) => {
                if self.escalation_threshold.is_some() {
                    if let Err(e) = self.registry.clear_unscannable(&tool.id) {
                        warn!(tool_id = %tool.id, error = %e, "failed to reset infrastructure strikes");
                    }
                }
                true
            }
            Err(e) => {
                error!(tool_id = %tool.id, error = %e, "failed to persist scan result");
                false
            }
        }
    }

    fn age(&self, since: DateTime<Utc>) -> Duration {
        (self.clock.now() - since).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Tracks one tool through its states and reports the in-flight ones.
struct Lifecycle<'a> {
    tool_id: &'a str,
    state: ToolState,
    report: &'a (dyn Fn(ToolState) + Sync),
}

impl<'a> Lifecycle<'a> {
    fn new(tool_id: &'a str, report: &'a (dyn Fn(ToolState) + Sync)) -> Self {
        Self {
            tool_id,
            state: ToolState::Pending,
            report,
        }
    }

    /// Terminal states are reported by the worker once the outcome is recorded.
    fn advance(&mut self, next: ToolState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?} for {}",
            self.state,
            next,
            self.tool_id
        );
        debug!(tool_id = self.tool_id, state = ?next, "state change");
        self.state = next;
        if !next.is_terminal() {
            (self.report)(next);
        }
    }
}

fn failure_message(attempt: &ScanAttempt) -> String {
    if let Some(e) = &attempt.spawn_error {
        return e.clone();
    }
    let text = attempt.raw_diagnostic_text.trim();
    if text.is_empty() {
        return match attempt.exit_status {
            Some(code) => format!("{} exited with status {}", attempt.strategy, code),
            None => format!("{} scan terminated without exit status", attempt.strategy),
        };
    }
    if text.chars().count() <= MAX_ERROR_LEN {
        return text.to_string();
    }
    let tail: String = text.chars().rev().take(MAX_ERROR_LEN).collect();
    format!("...{}", tail.chars().rev().collect::<String>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::model::{Security, Vulnerabilities};
    use crate::scan_cache::{DEFAULT_FAILED_SCAN_TTL, DEFAULT_UNSCANNABLE_TTL};
    use crate::testing::{
        canned_failure, canned_success, canned_timeout, ManualClock, MemoryStore,
        RecordingSleeper, ScriptedScanner,
    };
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        scan_root: PathBuf,
        cache: Cache,
        clock: Arc<ManualClock>,
        sleeper: Arc<RecordingSleeper>,
        scanner: Arc<ScriptedScanner>,
        store: Arc<MemoryStore>,
    }

    impl Harness {
        fn new(scanner: ScriptedScanner, store: MemoryStore) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let clock = Arc::new(ManualClock::default());
            let cache = Cache::at(tmp.path().join("cache")).with_clock(clock.clone());
            Self {
                scan_root: tmp.path().join("scans"),
                _tmp: tmp,
                cache,
                clock,
                sleeper: Arc::new(RecordingSleeper::default()),
                scanner: Arc::new(scanner),
                store: Arc::new(store),
            }
        }

        fn failed(&self) -> FailedScanCache {
            FailedScanCache::new(self.cache.clone(), DEFAULT_FAILED_SCAN_TTL)
        }

        fn registry(&self) -> UnscannableRegistry {
            UnscannableRegistry::new(self.cache.clone(), DEFAULT_UNSCANNABLE_TTL)
                .with_static_ids(["docker_hub:library/scratch"])
        }

        fn orchestrator(&self) -> ScanOrchestrator {
            let invoker = ScannerInvoker::new(self.scanner.clone()).with_remote_first(false);
            ScanOrchestrator::new(
                invoker,
                self.store.clone(),
                CacheIsolationManager::new(&self.scan_root),
                self.failed(),
                self.registry(),
            )
            .with_retry_policy(RetryPolicy::default().without_jitter())
            .with_clock(self.clock.clone())
            .with_sleeper(self.sleeper.clone())
        }
    }

    fn tool(name: &str) -> ToolRecord {
        ToolRecord::new(format!("docker_hub:library/{name}"))
    }

    fn tools(n: usize) -> Vec<ToolRecord> {
        (0..n).map(|i| tool(&format!("tool{i}"))).collect()
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let timeout = canned_failure(1, "dial tcp 10.0.0.1:443: i/o timeout");
        let scanner = ScriptedScanner::new(vec![
            timeout.clone(),
            timeout.clone(),
            timeout,
            canned_success(0, 2, 1, 0),
        ]);
        let h = Harness::new(scanner, MemoryStore::default());

        let batch = h
            .orchestrator()
            .scan_batch(&[tool("postgres")], 1, false, |_| {})
            .await
            .unwrap();

        assert_eq!(batch.succeeded, 1);
        let result = batch.outcomes[0].result.as_ref().unwrap();
        assert!(result.success);
        assert_eq!(result.retry_count, 3);
        assert_eq!(
            h.sleeper.waits(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );

        let stored = h.store.get("docker_hub:library/postgres").unwrap();
        assert_eq!(stored.security.status, SecurityStatus::Vulnerable);
        assert_eq!(stored.security.scanned_tag.as_deref(), Some("latest"));
        assert_eq!(stored.security.trivy_scan_date, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_progress_reports_each_transition() {
        let scanner = ScriptedScanner::new(vec![
            canned_failure(1, "dial tcp 10.0.0.1:443: i/o timeout"),
            canned_success(0, 0, 0, 0),
        ]);
        let h = Harness::new(scanner, MemoryStore::default());
        let states = std::sync::Mutex::new(Vec::new());

        h.orchestrator()
            .scan_batch(&[tool("redis")], 1, false, |p| {
                states.lock().unwrap().push((p.completed, p.state))
            })
            .await
            .unwrap();

        assert_eq!(
            states.into_inner().unwrap(),
            vec![
                (0, ToolState::Attempting),
                (0, ToolState::Retry),
                (0, ToolState::Attempting),
                (1, ToolState::Succeeded),
            ]
        );
    }

    #[tokio::test]
    async fn test_persistent_rate_limit_exhausts_retries() {
        let scanner = ScriptedScanner::new(vec![canned_failure(
            1,
            "toomanyrequests: You have reached your pull rate limit",
        )]);
        let h = Harness::new(scanner, MemoryStore::default());
        let target = tool("busy");

        let batch = h
            .orchestrator()
            .scan_batch(&[target.clone()], 1, false, |_| {})
            .await
            .unwrap();

        let outcome = &batch.outcomes[0];
        assert_eq!(outcome.state, ToolState::FailedExhausted);
        let result = outcome.result.as_ref().unwrap();
        assert_eq!(result.error_type, Some(ErrorKind::RateLimit));
        assert_eq!(result.retry_count, RetryPolicy::default().max_attempts - 1);
        assert_eq!(result.retry_count, 3);
        assert_eq!(h.scanner.calls(), 4);
        assert_eq!(
            h.sleeper.waits(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );

        let entry = h.failed().failure(&target.id).unwrap();
        assert_eq!(entry.expires_at - entry.cached_at, chrono::Duration::hours(1));
        assert!(!h.registry().is_unscannable(&target.id));
        assert_eq!(h.store.saves(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_retries_midway() {
        let scanner = ScriptedScanner::new(vec![canned_success(0, 0, 0, 0)]).with_script(
            "ghost:latest",
            vec![
                canned_failure(1, "dial tcp 10.0.0.1:443: i/o timeout"),
                canned_failure(1, "MANIFEST_UNKNOWN: manifest unknown"),
            ],
        );
        let h = Harness::new(scanner, MemoryStore::default());

        let batch = h
            .orchestrator()
            .scan_batch(&[tool("ghost"), tool("redis")], 1, false, |_| {})
            .await
            .unwrap();

        assert_eq!(batch.succeeded, 1);
        let ghost = batch
            .outcomes
            .iter()
            .find(|o| o.tool_id == "docker_hub:library/ghost")
            .unwrap();
        assert_eq!(ghost.state, ToolState::FailedPermanent);
        let result = ghost.result.as_ref().unwrap();
        assert_eq!(result.error_type, Some(ErrorKind::ManifestUnknown));
        assert_eq!(result.retry_count, 1);
        assert_eq!(
            h.scanner.scanned_images(),
            vec!["ghost:latest", "ghost:latest", "redis:latest"]
        );
        assert_eq!(h.sleeper.waits(), vec![Duration::from_secs(1)]);
        assert!(h.registry().is_unscannable("docker_hub:library/ghost"));
    }

    #[tokio::test]
    async fn test_manifest_unknown_is_permanent() {
        let scanner = ScriptedScanner::new(vec![canned_failure(
            1,
            "FATAL: MANIFEST_UNKNOWN: manifest unknown",
        )]);
        let h = Harness::new(scanner, MemoryStore::default());

        let batch = h
            .orchestrator()
            .scan_batch(&[tool("ghost")], 1, false, |_| {})
            .await
            .unwrap();

        let outcome = &batch.outcomes[0];
        assert_eq!(outcome.state, ToolState::FailedPermanent);
        let result = outcome.result.as_ref().unwrap();
        assert_eq!(result.error_type, Some(ErrorKind::ManifestUnknown));
        assert_eq!(result.retry_count, 0);
        assert_eq!(h.scanner.calls(), 1);
        assert!(h.sleeper.waits().is_empty());

        let entry = h.registry().info("docker_hub:library/ghost").unwrap();
        assert_eq!(
            entry.expires_at - entry.cached_at,
            chrono::Duration::days(7)
        );
        assert!(!h.failed().is_failed("docker_hub:library/ghost"));
        assert_eq!(
            batch.failures_by_kind()[&ErrorKind::ManifestUnknown],
            vec!["docker_hub:library/ghost"]
        );
    }

    #[tokio::test]
    async fn test_failure_keeps_existing_security_data() {
        let clock = ManualClock::default();
        let known_good = tool("redis").with_security(Security {
            status: SecurityStatus::Vulnerable,
            trivy_scan_date: Some(clock.now() - chrono::Duration::days(30)),
            scanned_tag: Some("7".to_string()),
            vulnerabilities: Vulnerabilities {
                critical: 2,
                high: 1,
                medium: 0,
                low: 4,
            },
            ..Security::default()
        });
        let scanner = ScriptedScanner::new(vec![canned_failure(1, "panic: runtime error")]);
        let h = Harness::new(scanner, MemoryStore::with_records(&[known_good.clone()]));

        let batch = h
            .orchestrator()
            .scan_batch(&[known_good.clone()], 1, false, |_| {})
            .await
            .unwrap();

        assert_eq!(batch.failed, 1);
        assert_eq!(batch.failures[&known_good.id], ErrorKind::ScannerCrash);
        assert_eq!(h.store.saves(), 0);
        assert_eq!(h.store.get(&known_good.id).unwrap(), known_good);
        // Infrastructure failures are retried on a later run, not this one.
        assert_eq!(h.scanner.calls(), 1);
        assert!(h.failed().is_failed(&known_good.id));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let scanner = ScriptedScanner::new(vec![canned_success(0, 0, 1, 0)])
            .with_delay(Duration::from_millis(20));
        let h = Harness::new(scanner, MemoryStore::default());

        let batch = h
            .orchestrator()
            .scan_batch(&tools(7), 3, false, |_| {})
            .await
            .unwrap();

        assert_eq!(batch.succeeded, 7);
        assert_eq!(batch.vulnerability_totals.medium, 7);
        assert!(h.scanner.max_in_flight() <= 3);
        assert!(h.scanner.max_in_flight() > 1);
    }

    #[tokio::test]
    async fn test_interrupted_batch_resumes_remaining_tools() {
        let h = Harness::new(
            ScriptedScanner::new(vec![canned_success(0, 0, 0, 0)]),
            MemoryStore::default(),
        );
        let catalog = tools(5);
        let orchestrator = h.orchestrator();
        let interrupt = orchestrator.interrupt();

        let first = orchestrator
            .scan_batch(&catalog, 1, false, |p| {
                if p.completed == 2 {
                    interrupt.trigger();
                }
            })
            .await
            .unwrap();
        assert!(first.interrupted);
        assert_eq!(first.succeeded, 2);
        assert_eq!(first.not_dispatched, 3);

        // Reload the catalog the way the next run would see it.
        let reloaded: Vec<ToolRecord> = catalog
            .iter()
            .map(|t| h.store.get(&t.id).unwrap_or_else(|| t.clone()))
            .collect();
        let second = h
            .orchestrator()
            .scan_batch(&reloaded, 1, false, |_| {})
            .await
            .unwrap();

        assert_eq!(second.succeeded, 3);
        assert_eq!(second.up_to_date, 2);
        assert_eq!(h.scanner.calls(), 5);
        assert_eq!(h.store.records().len(), 5);
    }

    #[tokio::test]
    async fn test_cached_failure_skipped_unless_forced() {
        let h = Harness::new(
            ScriptedScanner::new(vec![canned_success(0, 0, 0, 0)]),
            MemoryStore::default(),
        );
        let target = tool("nginx");
        h.failed()
            .mark_failed(&target.id, ErrorKind::RateLimit, "toomanyrequests")
            .unwrap();

        let batch = h
            .orchestrator()
            .scan_batch(&[target.clone()], 1, false, |_| {})
            .await
            .unwrap();
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.outcomes[0].state, ToolState::SkippedCached);
        assert_eq!(h.scanner.calls(), 0);

        let forced = h
            .orchestrator()
            .scan_batch(&[target.clone()], 1, true, |_| {})
            .await
            .unwrap();
        assert_eq!(forced.succeeded, 1);
        assert!(!h.failed().is_failed(&target.id));
    }

    #[tokio::test]
    async fn test_cached_failure_expires() {
        let h = Harness::new(
            ScriptedScanner::new(vec![canned_success(0, 0, 0, 0)]),
            MemoryStore::default(),
        );
        let target = tool("nginx");
        h.failed()
            .mark_failed(&target.id, ErrorKind::NetworkTimeout, "i/o timeout")
            .unwrap();
        h.clock.advance(DEFAULT_FAILED_SCAN_TTL + Duration::from_secs(1));

        let batch = h
            .orchestrator()
            .scan_batch(&[target], 1, false, |_| {})
            .await
            .unwrap();
        assert_eq!(batch.succeeded, 1);
    }

    #[tokio::test]
    async fn test_registry_honored_even_when_forced() {
        let h = Harness::new(
            ScriptedScanner::new(vec![canned_success(0, 0, 0, 0)]),
            MemoryStore::default(),
        );
        let gone = tool("gone");
        h.registry()
            .mark_unscannable(&gone.id, Some(ErrorKind::ImageNotFound), "not found")
            .unwrap();

        let batch = h
            .orchestrator()
            .scan_batch(&[gone, tool("scratch")], 2, true, |_| {})
            .await
            .unwrap();

        assert_eq!(batch.skipped, 2);
        assert!(batch
            .outcomes
            .iter()
            .all(|o| o.state == ToolState::SkippedUnscannable));
        assert_eq!(h.scanner.calls(), 0);
    }

    #[tokio::test]
    async fn test_selection_by_staleness_and_source() {
        let h = Harness::new(
            ScriptedScanner::new(vec![canned_success(0, 0, 0, 0)]),
            MemoryStore::default(),
        );
        let now = h.clock.now();
        let scanned = |days: i64| Security {
            status: SecurityStatus::Ok,
            trivy_scan_date: Some(now - chrono::Duration::days(days)),
            scanned_tag: Some("latest".to_string()),
            ..Security::default()
        };
        let catalog = vec![
            tool("fresh").with_security(scanned(1)),
            tool("stale").with_security(scanned(8)),
            tool("never"),
            ToolRecord::new("github:acme/cli"),
        ];

        let orchestrator = h.orchestrator();
        let selected: Vec<&str> = orchestrator
            .select_for_scan(&catalog, false)
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(
            selected,
            vec!["docker_hub:library/stale", "docker_hub:library/never"]
        );
        assert_eq!(orchestrator.select_for_scan(&catalog, true).len(), 3);

        let batch = orchestrator
            .scan_batch(&catalog, 1, false, |_| {})
            .await
            .unwrap();
        assert_eq!(batch.total, 4);
        assert_eq!(batch.succeeded, 2);
        assert_eq!(batch.up_to_date, 2);
        assert_eq!(h.scanner.scanned_images(), vec!["stale:latest", "never:latest"]);
    }

    #[tokio::test]
    async fn test_timeout_on_last_attempt_is_scanner_crash() {
        let h = Harness::new(
            ScriptedScanner::new(vec![canned_timeout()]),
            MemoryStore::default(),
        );
        let orchestrator = h.orchestrator().with_retry_policy(RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default().without_jitter()
        });

        let batch = orchestrator
            .scan_batch(&[tool("slow")], 1, false, |_| {})
            .await
            .unwrap();

        let outcome = &batch.outcomes[0];
        assert_eq!(outcome.state, ToolState::FailedExhausted);
        let result = outcome.result.as_ref().unwrap();
        assert_eq!(result.error_type, Some(ErrorKind::ScannerCrash));
        assert_eq!(result.retry_count, 1);
        assert!(h.failed().is_failed("docker_hub:library/slow"));
    }

    #[tokio::test]
    async fn test_unknown_error_retried_once() {
        let h = Harness::new(
            ScriptedScanner::new(vec![canned_failure(3, "something odd happened")]),
            MemoryStore::default(),
        );

        let batch = h
            .orchestrator()
            .scan_batch(&[tool("odd")], 1, false, |_| {})
            .await
            .unwrap();

        let result = batch.outcomes[0].result.as_ref().unwrap();
        assert_eq!(result.error_type, Some(ErrorKind::Unknown));
        assert_eq!(result.retry_count, 1);
        assert!(h.failed().is_failed("docker_hub:library/odd"));
        assert!(!h.registry().is_unscannable("docker_hub:library/odd"));
    }

    #[tokio::test]
    async fn test_infrastructure_failures_escalate() {
        let h = Harness::new(
            ScriptedScanner::new(vec![canned_failure(1, "no space left on device")]),
            MemoryStore::default(),
        );
        let flaky = tool("flaky");

        for _ in 0..2 {
            h.orchestrator()
                .with_escalation_threshold(Some(2))
                .scan_batch(&[flaky.clone()], 1, true, |_| {})
                .await
                .unwrap();
        }

        assert!(h.registry().is_unscannable(&flaky.id));
        assert_eq!(h.scanner.calls(), 2);
    }

    #[tokio::test]
    async fn test_persist_error_does_not_abort_batch() {
        let h = Harness::new(
            ScriptedScanner::new(vec![canned_success(1, 0, 0, 0)]),
            MemoryStore::default().failing_on("docker_hub:library/tool0"),
        );

        let batch = h
            .orchestrator()
            .scan_batch(&tools(3), 1, false, |_| {})
            .await
            .unwrap();

        assert_eq!(batch.succeeded, 3);
        assert_eq!(batch.persist_errors, 1);
        assert_eq!(h.store.records().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_cache_directory_shared_and_removed() {
        let h = Harness::new(
            ScriptedScanner::new(vec![canned_success(0, 0, 0, 0)]),
            MemoryStore::default(),
        );

        h.orchestrator()
            .scan_batch(&tools(4), 2, false, |_| {})
            .await
            .unwrap();

        let dirs = h.scanner.cache_dirs();
        assert_eq!(dirs.len(), 1);
        assert!(dirs.iter().all(|d| !d.exists()));
        assert_eq!(std::fs::read_dir(&h.scan_root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_batches_use_distinct_directories() {
        let h = Harness::new(
            ScriptedScanner::new(vec![canned_success(0, 0, 0, 0)])
                .with_delay(Duration::from_millis(5)),
            MemoryStore::default(),
        );
        let first: Vec<ToolRecord> = (0..5).map(|i| tool(&format!("a{i}"))).collect();
        let second: Vec<ToolRecord> = (0..5).map(|i| tool(&format!("b{i}"))).collect();
        let (left, right) = (h.orchestrator(), h.orchestrator());

        let (a, b) = tokio::join!(
            left.scan_batch(&first, 2, false, |_| {}),
            right.scan_batch(&second, 2, false, |_| {})
        );

        assert_eq!(a.unwrap().succeeded, 5);
        assert_eq!(b.unwrap().succeeded, 5);
        assert_eq!(h.scanner.cache_dirs().len(), 2);
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_fatal() {
        let h = Harness::new(
            ScriptedScanner::new(vec![canned_success(0, 0, 0, 0)]),
            MemoryStore::default(),
        );
        std::fs::write(&h.scan_root, "not a directory").unwrap();

        let err = h
            .orchestrator()
            .scan_batch(&tools(2), 1, false, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::CacheProvision { .. }));
        assert_eq!(h.scanner.calls(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_has_no_side_effects() {
        let h = Harness::new(
            ScriptedScanner::new(vec![canned_success(0, 0, 0, 0)]),
            MemoryStore::default(),
        );
        let catalog = vec![
            tool("postgres").with_tags(vec!["16-bullseye".into(), "stable".into()]),
            tool("cached"),
        ];
        h.failed()
            .mark_failed("docker_hub:library/cached", ErrorKind::RateLimit, "429")
            .unwrap();
        h.clock.advance(DEFAULT_FAILED_SCAN_TTL * 2);

        let plan = h.orchestrator().dry_run(&catalog, false);

        // The expired failure no longer blocks the tool but is left on disk.
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].would_scan_image_ref, "postgres:stable");
        assert_eq!(plan[0].current_status, SecurityStatus::Unknown);
        assert_eq!(plan[0].last_scan_age, None);
        assert_eq!(h.scanner.calls(), 0);
        assert!(h
            .cache
            .dir()
            .join(crate::scan_cache::FAILED_CATEGORY)
            .join("docker_hub_library_cached.json")
            .exists());
        assert!(!h.scan_root.exists());
    }

    #[test]
    fn test_failure_message_truncates_from_the_front() {
        let mut attempt = canned_failure(1, &"x".repeat(MAX_ERROR_LEN * 2));
        attempt.raw_diagnostic_text.push_str("END");
        let message = failure_message(&attempt);
        assert!(message.starts_with("..."));
        assert!(message.ends_with("END"));

        let silent = canned_failure(2, "");
        assert_eq!(failure_message(&silent), "remote exited with status 2");
    }
}

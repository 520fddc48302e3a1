//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::{Clock, Sleeper};
use crate::error::{Error, Result};
use crate::invoker::VulnerabilityScanner;
use crate::model::{AttemptStage, ScanAttempt, ScanStrategy, ToolRecord};
use crate::storage::ToolStore;

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Records requested waits instead of sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.waits.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

pub fn canned_success(critical: u32, high: u32, medium: u32, low: u32) -> ScanAttempt {
    let severities = [
        ("CRITICAL", critical),
        ("HIGH", high),
        ("MEDIUM", medium),
        ("LOW", low),
    ];
    let vulns: Vec<String> = severities
        .iter()
        .flat_map(|(sev, n)| (0..*n).map(move |i| format!(r#"{{"VulnerabilityID":"CVE-{sev}-{i}","Severity":"{sev}"}}"#)))
        .collect();
    let stdout = format!(
        r#"{{"SchemaVersion":2,"Results":[{{"Target":"img","Vulnerabilities":[{}]}}]}}"#,
        vulns.join(",")
    );

    let mut attempt = blank_attempt();
    attempt.exit_status = Some(0);
    attempt.stdout = stdout;
    attempt
}

pub fn canned_failure(exit: i32, stderr: &str) -> ScanAttempt {
    let mut attempt = blank_attempt();
    attempt.exit_status = Some(exit);
    attempt.raw_diagnostic_text = stderr.to_string();
    attempt
}

pub fn canned_timeout() -> ScanAttempt {
    let mut attempt = blank_attempt();
    attempt.timed_out = true;
    attempt.raw_diagnostic_text = "scan timed out".to_string();
    attempt
}

fn blank_attempt() -> ScanAttempt {
    ScanAttempt {
        image_ref: String::new(),
        strategy: ScanStrategy::Remote,
        stage: AttemptStage::Scan,
        started_at: Utc::now(),
        duration: Duration::from_millis(5),
        exit_status: None,
        raw_diagnostic_text: String::new(),
        stdout: String::new(),
        timed_out: false,
        spawn_error: None,
    }
}

/// Plays back canned attempts. Each image has its own script, falling back to
/// the default script; the last entry of a script repeats once it runs out.
pub struct ScriptedScanner {
    default_script: Mutex<VecDeque<ScanAttempt>>,
    scripts: Mutex<HashMap<String, VecDeque<ScanAttempt>>>,
    calls: Mutex<Vec<(String, ScanStrategy, PathBuf)>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedScanner {
    pub fn new(default_script: Vec<ScanAttempt>) -> Self {
        Self {
            default_script: Mutex::new(default_script.into()),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_script(self, image_ref: &str, script: Vec<ScanAttempt>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(image_ref.to_string(), script.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn strategies(&self) -> Vec<ScanStrategy> {
        self.calls.lock().unwrap().iter().map(|c| c.1).collect()
    }

    pub fn scanned_images(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.0.clone()).collect()
    }

    pub fn cache_dirs(&self) -> HashSet<PathBuf> {
        self.calls.lock().unwrap().iter().map(|c| c.2.clone()).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next(&self, image_ref: &str) -> ScanAttempt {
        let mut scripts = self.scripts.lock().unwrap();
        let mut default_script = self.default_script.lock().unwrap();
        let script = scripts.get_mut(image_ref).unwrap_or(&mut *default_script);
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap_or_else(|| canned_success(0, 0, 0, 0))
        }
    }
}

#[async_trait]
impl VulnerabilityScanner for ScriptedScanner {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn scan(
        &self,
        image_ref: &str,
        strategy: ScanStrategy,
        cache_dir: &Path,
        _timeout: Duration,
    ) -> ScanAttempt {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((image_ref.to_string(), strategy, cache_dir.to_path_buf()));

        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }

        let mut attempt = self.next(image_ref);
        attempt.image_ref = image_ref.to_string();
        attempt.strategy = strategy;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        attempt
    }
}

/// In-memory catalog keyed by id.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, ToolRecord>>,
    saves: AtomicUsize,
    failing_ids: HashSet<String>,
}

impl MemoryStore {
    pub fn with_records(records: &[ToolRecord]) -> Self {
        let store = Self::default();
        {
            let mut map = store.records.lock().unwrap();
            for r in records {
                map.insert(r.id.clone(), r.clone());
            }
        }
        store
    }

    pub fn failing_on(mut self, id: &str) -> Self {
        self.failing_ids.insert(id.to_string());
        self
    }

    pub fn records(&self) -> Vec<ToolRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<ToolRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolStore for MemoryStore {
    async fn save(&self, tools: &[ToolRecord], merge: bool) -> Result<()> {
        if let Some(tool) = tools.iter().find(|t| self.failing_ids.contains(&t.id)) {
            return Err(Error::Storage {
                path: PathBuf::from(&tool.id),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        let mut map = self.records.lock().unwrap();
        if !merge {
            map.clear();
        }
        for tool in tools {
            map.insert(tool.id.clone(), tool.clone());
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

use crate::model::{AttemptStage, ScanAttempt, ScanStrategy};

/// Runs the Trivy CLI (and `docker pull` for local scans) as child processes.
#[derive(Debug, Clone)]
pub struct TrivyScanner {
    trivy_path: PathBuf,
    docker_path: PathBuf,
}

impl TrivyScanner {
    pub fn new(trivy_path: impl Into<PathBuf>, docker_path: impl Into<PathBuf>) -> Self {
        Self {
            trivy_path: trivy_path.into(),
            docker_path: docker_path.into(),
        }
    }

    /// Whether the scanner binary resolves, either as a path or through `PATH`.
    pub fn is_installed(&self) -> bool {
        which::which(&self.trivy_path).is_ok()
    }

    fn scan_args(image_ref: &str, strategy: ScanStrategy, cache_dir: &Path) -> Vec<String> {
        let source = match strategy {
            ScanStrategy::Remote => "remote",
            ScanStrategy::Local => "docker",
        };
        vec![
            "image".to_string(),
            "--quiet".to_string(),
            "--format".to_string(),
            "json".to_string(),
            "--severity".to_string(),
            "CRITICAL,HIGH,MEDIUM,LOW".to_string(),
            "--scanners".to_string(),
            "vuln".to_string(),
            "--image-src".to_string(),
            source.to_string(),
            "--cache-dir".to_string(),
            cache_dir.display().to_string(),
            image_ref.to_string(),
        ]
    }
}

impl Default for TrivyScanner {
    fn default() -> Self {
        Self::new("trivy", "docker")
    }
}

#[async_trait]
impl super::VulnerabilityScanner for TrivyScanner {
    fn name(&self) -> &'static str {
        "Trivy"
    }

    async fn scan(
        &self,
        image_ref: &str,
        strategy: ScanStrategy,
        cache_dir: &Path,
        timeout: Duration,
    ) -> ScanAttempt {
        if strategy == ScanStrategy::Local {
            let pull = run(
                &self.docker_path,
                &["pull".to_string(), image_ref.to_string()],
                None,
                timeout,
                image_ref,
                strategy,
                AttemptStage::Pull,
            )
            .await;
            if !pull.is_success() {
                return pull;
            }
        }

        let args = Self::scan_args(image_ref, strategy, cache_dir);
        run(
            &self.trivy_path,
            &args,
            Some(cache_dir),
            timeout,
            image_ref,
            strategy,
            AttemptStage::Scan,
        )
        .await
    }
}

async fn run(
    program: &Path,
    args: &[String],
    cache_dir: Option<&Path>,
    timeout: Duration,
    image_ref: &str,
    strategy: ScanStrategy,
    stage: AttemptStage,
) -> ScanAttempt {
    let started_at = Utc::now();
    let clock = Instant::now();
    debug!(program = %program.display(), ?args, "spawning");

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cache_dir {
        command.env("TRIVY_CACHE_DIR", dir);
    }

    let mut attempt = ScanAttempt {
        image_ref: image_ref.to_string(),
        strategy,
        stage,
        started_at,
        duration: Duration::ZERO,
        exit_status: None,
        raw_diagnostic_text: String::new(),
        stdout: String::new(),
        timed_out: false,
        spawn_error: None,
    };

    // Dropping the output future on timeout kills the child (kill_on_drop).
    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => {
            attempt.exit_status = output.status.code();
            attempt.stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            attempt.raw_diagnostic_text = String::from_utf8_lossy(&output.stderr).into_owned();
        }
        Ok(Err(e)) => {
            attempt.spawn_error = Some(format!("failed to run {}: {}", program.display(), e));
        }
        Err(_) => {
            attempt.timed_out = true;
            attempt.raw_diagnostic_text = format!(
                "{} timed out after {}s",
                stage_name(stage),
                timeout.as_secs()
            );
        }
    }

    attempt.duration = clock.elapsed();
    attempt
}

fn stage_name(stage: AttemptStage) -> &'static str {
    match stage {
        AttemptStage::Pull => "image pull",
        AttemptStage::Scan => "scan",
    }
}

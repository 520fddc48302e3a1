//! Failure classification for scanner diagnostics.
//!
//! Scanner and registry errors arrive as free text on stderr. The rules below
//! are evaluated top to bottom and the first match wins. Registry errors such as
//! "manifest unknown" frequently arrive wrapped in generic transport wording, so
//! the specific rules sit above the network rule.

use regex::Regex;
use std::sync::LazyLock;

use crate::model::{AttemptStage, ErrorKind, ScanAttempt};

struct Rule {
    pattern: Regex,
    kind: ErrorKind,
}

fn rule(pattern: &str, kind: ErrorKind) -> Rule {
    Rule {
        pattern: Regex::new(&format!("(?i){}", pattern)).expect("static classifier pattern"),
        kind,
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(
            r"manifest[^\n]*(unknown|not found|invalid)|manifest_unknown",
            ErrorKind::ManifestUnknown,
        ),
        rule(
            r"not found|\b404\b|no such image|repository does not exist|name unknown",
            ErrorKind::ImageNotFound,
        ),
        rule(
            r"unauthorized|forbidden|\b401\b|\b403\b|authentication required|denied: requested access",
            ErrorKind::Unauthorized,
        ),
        rule(
            r"cache[^\n]*lock|lock[^\n]*cache|lock[^\n]*time(d)? ?out|time(d)? ?out[^\n]*lock",
            ErrorKind::CacheLock,
        ),
        rule(
            r"time(d)? ?out|connection|network|no such host|\bdns\b|name resolution|\beof\b",
            ErrorKind::NetworkTimeout,
        ),
        rule(
            r"\b429\b|rate limit|too many requests|toomanyrequests",
            ErrorKind::RateLimit,
        ),
        rule(
            r"unsupported|cannot scan|unable to scan|no supported os",
            ErrorKind::UnscannableImage,
        ),
    ]
});

/// Text that means the scanner or the container daemon itself is unhealthy.
static INFRASTRUCTURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)vulnerability db|\bdb error|no space left|docker daemon|panic:|segmentation fault|signal: killed",
    )
    .expect("static classifier pattern")
});

/// Classifies a failed scan from its exit code and captured stderr.
///
/// # Example
///
/// ```
/// use imagescan::classify::classify;
/// use imagescan::model::{ErrorKind, ErrorTier};
///
/// let kind = classify(Some(1), "GET https://registry-1.docker.io: MANIFEST_UNKNOWN: manifest unknown");
/// assert_eq!(kind, ErrorKind::ManifestUnknown);
/// assert_eq!(kind.tier(), ErrorTier::Permanent);
/// ```
pub fn classify(exit_code: Option<i32>, diagnostic: &str) -> ErrorKind {
    classify_stage(exit_code, diagnostic, AttemptStage::Scan)
}

/// Classifies a failed attempt, taking process-level facts into account.
pub fn classify_attempt(attempt: &ScanAttempt) -> ErrorKind {
    if attempt.spawn_error.is_some() {
        return match attempt.stage {
            AttemptStage::Pull => ErrorKind::PullFailed,
            AttemptStage::Scan => ErrorKind::ScannerCrash,
        };
    }
    if attempt.timed_out {
        return ErrorKind::NetworkTimeout;
    }
    classify_stage(
        attempt.exit_status,
        &attempt.raw_diagnostic_text,
        attempt.stage,
    )
}

fn classify_stage(exit_code: Option<i32>, diagnostic: &str, stage: AttemptStage) -> ErrorKind {
    if let Some(rule) = RULES.iter().find(|r| r.pattern.is_match(diagnostic)) {
        return rule.kind;
    }

    let infrastructure = match stage {
        AttemptStage::Pull => ErrorKind::PullFailed,
        AttemptStage::Scan => ErrorKind::ScannerCrash,
    };

    if INFRASTRUCTURE.is_match(diagnostic) {
        return infrastructure;
    }

    let failed_exit = exit_code != Some(0);
    if failed_exit && (diagnostic.trim().is_empty() || stage == AttemptStage::Pull) {
        return infrastructure;
    }

    ErrorKind::Unknown
}

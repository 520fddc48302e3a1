use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix used by catalog ids of container images hosted on Docker Hub.
pub const DOCKER_HUB_PREFIX: &str = "docker_hub";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    DockerHub,
    Github,
    Other,
}

impl SourceKind {
    /// Derives the source from the `source:` prefix of a catalog id.
    pub fn from_id(id: &str) -> Self {
        match id.split_once(':').map(|(prefix, _)| prefix) {
            Some(DOCKER_HUB_PREFIX) => SourceKind::DockerHub,
            Some("github") => SourceKind::Github,
            _ => SourceKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::DockerHub => "docker_hub",
            SourceKind::Github => "github",
            SourceKind::Other => "other",
        }
    }

    /// Whether records from this source name a container image that can be scanned.
    pub fn is_scannable(&self) -> bool {
        matches!(self, SourceKind::DockerHub)
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityStatus {
    Ok,
    Vulnerable,
    #[default]
    Unknown,
}

impl SecurityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityStatus::Ok => "ok",
            SecurityStatus::Vulnerable => "vulnerable",
            SecurityStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SecurityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Vulnerability counts by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Vulnerabilities {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl Vulnerabilities {
    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low
    }

    /// Status implied by these counts: any critical or high finding is vulnerable.
    pub fn status(&self) -> SecurityStatus {
        if self.critical + self.high > 0 {
            SecurityStatus::Vulnerable
        } else {
            SecurityStatus::Ok
        }
    }

    pub fn accumulate(&mut self, other: &Vulnerabilities) {
        self.critical += other.critical;
        self.high += other.high;
        self.medium += other.medium;
        self.low += other.low;
    }
}

/// Key of the derived safety flag other catalog writers store on the block.
const IS_SAFE_KEY: &str = "is_safe";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Security {
    pub status: SecurityStatus,
    pub trivy_scan_date: Option<DateTime<Utc>>,
    pub scanned_tag: Option<String>,
    pub vulnerabilities: Vulnerabilities,
    /// Fields of the block this crate does not own, kept as found.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Security {
    /// No critical or high findings and not marked vulnerable.
    pub fn is_safe(&self) -> bool {
        self.vulnerabilities.critical == 0
            && self.vulnerabilities.high == 0
            && self.status != SecurityStatus::Vulnerable
    }
}

/// A catalog record as seen by the scan engine.
///
/// Only the fields the engine reads or writes are typed. Everything else the
/// catalog stores on a record is carried through `extra` untouched so that a
/// merge-save never drops data owned by other collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub id: String,
    #[serde(default)]
    pub docker_tags: Vec<String>,
    #[serde(default)]
    pub security: Security,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ToolRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            docker_tags: Vec::new(),
            security: Security::default(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.docker_tags = tags;
        self
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    pub fn source(&self) -> SourceKind {
        SourceKind::from_id(&self.id)
    }

    /// Returns a copy of this record with its security block replaced by a
    /// successful scan outcome.
    pub fn with_scan_outcome(
        &self,
        vulnerabilities: Vulnerabilities,
        scanned_tag: Option<String>,
        scanned_at: DateTime<Utc>,
    ) -> Self {
        let mut updated = self.clone();
        let security = &mut updated.security;
        security.status = vulnerabilities.status();
        security.trivy_scan_date = Some(scanned_at);
        security.scanned_tag = scanned_tag;
        security.vulnerabilities = vulnerabilities;
        if security.extra.contains_key(IS_SAFE_KEY) {
            let safe = security.is_safe();
            security.extra.insert(IS_SAFE_KEY.to_string(), safe.into());
        }
        updated
    }
}

use serde::Deserialize;

use crate::model::Vulnerabilities;

// Trivy JSON output: {"Results": [{"Target": "...", "Vulnerabilities": [...] | null}]}
#[derive(Deserialize)]
struct TrivyReport {
    #[serde(rename = "Results", default)]
    results: Option<Vec<TrivyTarget>>,
}

#[derive(Deserialize)]
struct TrivyTarget {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "Severity", default)]
    severity: Option<String>,
}

/// Counts findings per severity in a Trivy JSON report.
///
/// Severities outside critical/high/medium/low are ignored.
pub fn parse_report(json: &str) -> Result<Vulnerabilities, serde_json::Error> {
    let report: TrivyReport = serde_json::from_str(json)?;
    let mut counts = Vulnerabilities::default();

    let findings = report
        .results
        .unwrap_or_default()
        .into_iter()
        .flat_map(|target| target.vulnerabilities.unwrap_or_default());

    for finding in findings {
        match finding.severity.as_deref() {
            Some("CRITICAL") => counts.critical += 1,
            Some("HIGH") => counts.high += 1,
            Some("MEDIUM") => counts.medium += 1,
            Some("LOW") => counts.low += 1,
            _ => {}
        }
    }

    Ok(counts)
}

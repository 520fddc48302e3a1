use crate::model::{BatchResult, DryRunEntry, ErrorKind, SecurityStatus, ToolState};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

use super::CacheReport;

#[derive(Tabled)]
struct FailureRow {
    #[tabled(rename = "Error")]
    kind: String,
    #[tabled(rename = "Tools")]
    count: usize,
    #[tabled(rename = "Examples")]
    examples: String,
}

#[derive(Tabled)]
struct ScannedRow {
    #[tabled(rename = "Tool")]
    tool: String,
    #[tabled(rename = "Image")]
    image: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Critical")]
    critical: u32,
    #[tabled(rename = "High")]
    high: u32,
    #[tabled(rename = "Medium")]
    medium: u32,
    #[tabled(rename = "Low")]
    low: u32,
    #[tabled(rename = "Retries")]
    retries: u32,
}

#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "Tool")]
    tool: String,
    #[tabled(rename = "Would scan")]
    image: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Last scan")]
    last_scan: String,
}

#[derive(Tabled)]
struct CacheRow {
    #[tabled(rename = "Tool")]
    tool: String,
    #[tabled(rename = "Error")]
    kind: String,
    #[tabled(rename = "Expires")]
    expires: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

pub fn print_batch_table(result: &BatchResult) -> Result<()> {
    let scanned: Vec<ScannedRow> = result
        .outcomes
        .iter()
        .filter(|o| o.state == ToolState::Succeeded)
        .filter_map(|o| {
            let r = o.result.as_ref()?;
            let v = r.vulnerabilities?;
            Some(ScannedRow {
                tool: truncate(&o.tool_id, 40),
                image: truncate(&r.image_ref, 40),
                status: format_status(v.status()),
                critical: v.critical,
                high: v.high,
                medium: v.medium,
                low: v.low,
                retries: r.retry_count,
            })
        })
        .collect();

    if !scanned.is_empty() {
        println!();
        println!("Scanned {} images:", scanned.len());
        println!();
        println!("{}", Table::new(scanned).with(Style::rounded()));
    }

    let grouped = result.failures_by_kind();
    if !grouped.is_empty() {
        println!();
        println!("Failed scans by error type:");
        println!();

        let rows: Vec<FailureRow> = grouped
            .iter()
            .map(|(kind, tools)| FailureRow {
                kind: format_kind(*kind),
                count: tools.len(),
                examples: truncate(&tools.iter().take(3).cloned().collect::<Vec<_>>().join(", "), 60),
            })
            .collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
    }

    println!();
    print_summary(result);
    Ok(())
}

fn print_summary(result: &BatchResult) {
    let totals = &result.vulnerability_totals;

    println!("Summary:");
    println!(
        "  Tools: {} succeeded, {} failed, {} skipped, {} up to date",
        result.succeeded, result.failed, result.skipped, result.up_to_date
    );
    if totals.total() > 0 {
        println!(
            "  Vulnerabilities: {} critical, {} high, {} medium, {} low",
            totals.critical, totals.high, totals.medium, totals.low
        );
    }
    if result.persist_errors > 0 {
        println!(
            "  \x1b[31m{} results could not be saved\x1b[0m",
            result.persist_errors
        );
    }
    if result.interrupted {
        println!(
            "  \x1b[33mInterrupted: {} tools not dispatched\x1b[0m",
            result.not_dispatched
        );
    }
    println!("  Duration: {}", format_duration(result.duration));
}

pub fn print_dry_run_table(plan: &[DryRunEntry]) -> Result<()> {
    println!();
    if plan.is_empty() {
        println!("Nothing to scan.");
        return Ok(());
    }

    println!("Would scan {} images:", plan.len());
    println!();

    let rows: Vec<PlanRow> = plan
        .iter()
        .map(|e| PlanRow {
            tool: truncate(&e.tool_id, 45),
            image: truncate(&e.would_scan_image_ref, 45),
            status: format_status(e.current_status),
            last_scan: e
                .last_scan_age
                .map(|age| format!("{} ago", format_duration(age)))
                .unwrap_or_else(|| "never".to_string()),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

pub fn print_cache_table(report: &CacheReport) -> Result<()> {
    println!();
    if report.unscannable.is_empty() && report.static_unscannable.is_empty() {
        println!("No unscannable images.");
    } else {
        println!(
            "Unscannable images ({}):",
            report.unscannable.len() + report.static_unscannable.len()
        );
        println!();

        let mut rows: Vec<CacheRow> = report
            .static_unscannable
            .iter()
            .map(|id| CacheRow {
                tool: truncate(id, 45),
                kind: "-".to_string(),
                expires: "never".to_string(),
                reason: "excluded by configuration".to_string(),
            })
            .collect();
        rows.extend(report.unscannable.iter().map(|e| CacheRow {
            tool: truncate(&e.key, 45),
            kind: e.value.error_type.map(format_kind).unwrap_or_else(|| "-".to_string()),
            expires: format_time(e.expires_at),
            reason: truncate(&e.value.reason, 50),
        }));
        println!("{}", Table::new(rows).with(Style::rounded()));
    }

    println!();
    if report.failed_scans.is_empty() {
        println!("No recently failed scans.");
    } else {
        println!("Recently failed scans ({}):", report.failed_scans.len());
        println!();

        let rows: Vec<CacheRow> = report
            .failed_scans
            .iter()
            .map(|e| CacheRow {
                tool: truncate(&e.key, 45),
                kind: format_kind(e.value.error_type),
                expires: format_time(e.expires_at),
                reason: truncate(&e.value.error, 50),
            })
            .collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
    }
    Ok(())
}

fn format_status(status: SecurityStatus) -> String {
    match status {
        SecurityStatus::Vulnerable => "\x1b[31mvulnerable\x1b[0m".to_string(),
        SecurityStatus::Ok => "\x1b[32mok\x1b[0m".to_string(),
        SecurityStatus::Unknown => "unknown".to_string(),
    }
}

fn format_kind(kind: ErrorKind) -> String {
    format!("{} ({})", kind, kind.tier())
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0..=59 => format!("{:.1}s", duration.as_secs_f64()),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        3600..=86_399 => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
        _ => format!("{}d {}h", secs / 86_400, (secs % 86_400) / 3600),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("postgres", 20), "postgres");
        assert_eq!(truncate("docker_hub:bitnami/postgresql", 12), "docker_hu...");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3 * 86_400 + 7200)), "3d 2h");
    }

    #[test]
    fn test_format_kind_includes_tier() {
        assert_eq!(
            format_kind(ErrorKind::ManifestUnknown),
            "manifest_unknown (permanent)"
        );
    }
}

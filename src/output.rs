//! CLI output formatting for run, stats and verify reports.

use std::path::Path;

use granule_core::{DownloadReport, StatsReport, VerifyReport};

/// Formats a byte count with binary units.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Command that retries the failed assets of `payload`.
#[must_use]
pub fn retry_command(payload: &Path) -> String {
    format!("granule-downloader --retry --payload-file {}", payload.display())
}

/// Summary lines for a download run.
#[must_use]
pub fn download_report_lines(report: &DownloadReport) -> Vec<String> {
    let mut lines = vec![
        format!("Collection: {}", report.collection),
        format!("Payload: {}", report.payload.display()),
    ];
    if report.reset_from_failed > 0 {
        lines.push(format!("Retried failed assets: {}", report.reset_from_failed));
    }
    lines.push(format!(
        "This run: {} succeeded, {} failed, {} not started, {}",
        report.succeeded,
        report.failed,
        report.not_started,
        format_bytes(report.bytes_this_run)
    ));
    lines.push(format!(
        "Total: {} assets, {} done, {} failed, {} pending, {} on disk",
        report.counts.total(),
        report.counts.done,
        report.counts.failed,
        report.counts.pending,
        format_bytes(report.total_bytes)
    ));
    if report.interrupted {
        lines.push("Interrupted: state saved, run the same command again to resume.".to_string());
    }
    if let Some(reason) = &report.auth_failure {
        lines.push(format!("Stopped on authentication failure: {reason}"));
        lines.push("Check ~/.netrc for urs.earthdata.nasa.gov or set EARTHDATA_TOKEN.".to_string());
    }
    if report.has_failures() {
        lines.push(format!("There were {} failed assets.", report.counts.failed));
        lines.push(format!("To retry them: {}", retry_command(&report.payload)));
    }
    lines
}

/// Lines for a stats report.
#[must_use]
pub fn stats_report_lines(report: &StatsReport) -> Vec<String> {
    let mut lines = vec![
        format!("Collection: {}", report.collection),
        format!("Payload: {}", report.payload.display()),
        format!("Total assets: {}", report.counts.total()),
        format!("Done: {}", report.counts.done),
        format!("Failed: {}", report.counts.failed),
        format!("Pending: {}", report.counts.pending),
        format!("Downloaded: {}", format_bytes(report.bytes_downloaded)),
        format!(
            "Attempts: {} ({} successful, {} failed, {} assets)",
            report.ledger.attempts,
            report.ledger.successes,
            report.ledger.failures,
            report.ledger.distinct_assets
        ),
    ];
    if !report.failure_kinds.is_empty() {
        let kinds: Vec<String> = report
            .failure_kinds
            .iter()
            .map(|(kind, count)| format!("{kind}={count}"))
            .collect();
        lines.push(format!("Failure kinds: {}", kinds.join(", ")));
    }
    if report.has_auth_failures() {
        lines.push(
            "Hint: authentication failures present; check ~/.netrc or EARTHDATA_TOKEN before retrying."
                .to_string(),
        );
    }
    if report.counts.failed > 0 {
        lines.push(format!("To retry: {}", retry_command(&report.payload)));
    }
    lines
}

/// Lines for a verify report.
#[must_use]
pub fn verify_report_lines(report: &VerifyReport) -> Vec<String> {
    let mut lines = vec![
        format!("Payload: {}", report.payload.display()),
        format!(
            "Checked {} done assets: {} intact, {} reopened ({} links missing)",
            report.checked, report.intact, report.reset, report.links_missing
        ),
    ];
    if report.reset > 0 {
        lines.push(format!(
            "Run `granule-downloader --payload-file {}` to fetch them again.",
            report.payload.display()
        ));
    }
    lines
}

/// Prints lines to stdout.
pub fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use granule_core::CollectionKey;
    use granule_core::ledger::LedgerSummary;
    use granule_core::store::StatusCounts;

    use super::*;

    fn report() -> DownloadReport {
        DownloadReport {
            payload: PathBuf::from("cache/X_v1_20240101_000000_payload.json"),
            collection: CollectionKey::new("X", "1"),
            reset_from_failed: 0,
            succeeded: 1,
            failed: 1,
            not_started: 0,
            bytes_this_run: 2048,
            counts: StatusCounts {
                pending: 0,
                in_progress: 0,
                done: 1,
                failed: 1,
            },
            total_bytes: 2048,
            auth_failure: None,
            interrupted: false,
            checkpoints: 1,
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_download_report_prints_retry_hint_on_failures() {
        let lines = download_report_lines(&report());
        assert!(lines.iter().any(|l| l.contains(
            "granule-downloader --retry --payload-file cache/X_v1_20240101_000000_payload.json"
        )));
    }

    #[test]
    fn test_download_report_without_failures_has_no_hint() {
        let mut clean = report();
        clean.counts.failed = 0;
        clean.failed = 0;
        let lines = download_report_lines(&clean);
        assert!(!lines.iter().any(|l| l.contains("--retry")));
    }

    #[test]
    fn test_stats_lines_show_counts() {
        let stats = StatsReport {
            payload: PathBuf::from("p_payload.json"),
            collection: CollectionKey::new("X", "1"),
            counts: StatusCounts {
                pending: 0,
                in_progress: 0,
                done: 1,
                failed: 1,
            },
            bytes_downloaded: 10,
            failure_kinds: [(granule_core::FetchErrorKind::Network, 1)].into_iter().collect(),
            asset_attempts: 2,
            ledger: LedgerSummary::default(),
        };
        let lines = stats_report_lines(&stats);
        assert!(lines.contains(&"Done: 1".to_string()));
        assert!(lines.contains(&"Failed: 1".to_string()));
        assert!(lines.contains(&"Failure kinds: network=1".to_string()));
    }
}

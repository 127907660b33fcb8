//! Terminal presentation of a fleet run

use std::io::Write;

use osupgrader_dispatch::{FleetObserver, FleetSummary, LogLine, ProgressSnapshot, Verdict};

/// Prints log lines and the summary to stdout, progress to stderr
#[derive(Debug, Default)]
pub struct ConsoleObserver;

impl FleetObserver for ConsoleObserver {
    fn on_progress(&self, progress: ProgressSnapshot) {
        eprintln!(
            "Progress: {}/{} ({:.0}%)",
            progress.completed,
            progress.total,
            progress.fraction() * 100.0
        );
    }

    fn on_log_line(&self, line: &LogLine) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", line);
    }

    fn on_summary(&self, summary: &FleetSummary) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", summary);
        let _ = match summary.verdict {
            Verdict::AllSucceeded => writeln!(out, "✓ {}", summary.verdict),
            Verdict::CompletedWithFailures => writeln!(out, "❌ {}", summary.verdict),
        };
        if !summary.manual_check.is_empty() {
            let _ = writeln!(out, "⚠ Manual check required for:");
            for machine in &summary.manual_check {
                let _ = writeln!(out, "  - {}", machine);
            }
        }
    }
}

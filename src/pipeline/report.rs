// End-of-run report: counts per phase and error kind, affected units, and
// one row per item and album

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use crate::catalog::albums::AlbumKind;
use crate::catalog::matching::MatchRule;
use crate::catalog::ItemStatus;
use crate::config::RunMode;
use crate::constants::REPORTS_FOLDER;
use crate::error::{ErrorKind, RecordedError, Result};
use super::state::write_json_atomic;
use super::{Phase, RunOutcome};

/// Counts for one phase of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSummary {
    pub phase: Option<Phase>,
    /// Units the phase looked at
    pub total: usize,
    /// Done in this run (or, in a dry run, would be done)
    pub processed: usize,
    /// Already complete from an earlier run
    pub already_done: usize,
    /// Out of scope or skipped by configuration
    pub skipped: usize,
    pub failed: usize,
    /// Imports the destination reported as already present
    pub duplicates: usize,
}

impl PhaseSummary {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase: Some(phase),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRow {
    pub id: String,
    pub output: String,
    pub status: ItemStatus,
    pub albums: Vec<String>,
    pub match_rule: Option<MatchRule>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumRow {
    pub name: String,
    pub kind: AlbumKind,
    pub members: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub mode: RunMode,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub phases: Vec<PhaseSummary>,
    pub items_total: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub match_rules: BTreeMap<MatchRule, usize>,
    pub error_counts: BTreeMap<ErrorKind, usize>,
    pub errors: Vec<RecordedError>,
    pub orphan_sidecars: Vec<String>,
    pub items: Vec<ItemRow>,
    pub albums: Vec<AlbumRow>,
}

impl RunReport {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseSummary> {
        self.phases.iter().find(|p| p.phase == Some(phase))
    }

    pub fn count_errors(&mut self) {
        self.error_counts.clear();
        for e in &self.errors {
            *self.error_counts.entry(e.kind).or_insert(0) += 1;
        }
    }
}

/// Write the report as `reports/report-<timestamp>.json` under the state dir.
pub fn write_report(state_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let path = state_dir
        .join(REPORTS_FOLDER)
        .join(format!("report-{}.json", report.started_at.format("%Y%m%dT%H%M%SZ")));
    write_json_atomic(&path, report)?;
    Ok(path)
}

/// Human-readable summary for the terminal.
pub fn render_summary(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Run {} ({}{}): {}",
        report.run_id,
        report.mode.as_str(),
        if report.dry_run { ", dry run" } else { "" },
        report.outcome.as_str()
    );
    let _ = writeln!(
        out,
        "Items: {} ({} matched, {} unmatched), albums: {}, orphan sidecars: {}",
        report.items_total,
        report.matched,
        report.unmatched,
        report.albums.len(),
        report.orphan_sidecars.len()
    );

    if !report.match_rules.is_empty() {
        let rules: Vec<String> = report
            .match_rules
            .iter()
            .map(|(rule, n)| format!("{:?}={}", rule, n))
            .collect();
        let _ = writeln!(out, "Match rules: {}", rules.join(", "));
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{:<10} {:>8} {:>10} {:>10} {:>8} {:>8} {:>6}",
        "PHASE", "TOTAL", if report.dry_run { "WOULD DO" } else { "DONE" }, "ALREADY", "SKIPPED", "FAILED", "DUPS"
    );
    for p in &report.phases {
        let name = p.phase.map(|ph| ph.as_str()).unwrap_or("-");
        let _ = writeln!(
            out,
            "{:<10} {:>8} {:>10} {:>10} {:>8} {:>8} {:>6}",
            name, p.total, p.processed, p.already_done, p.skipped, p.failed, p.duplicates
        );
    }

    if !report.error_counts.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Errors:");
        for (kind, n) in &report.error_counts {
            let _ = writeln!(out, "  {:<16} {}", format!("{:?}", kind), n);
        }
        for e in report.errors.iter().take(20) {
            let _ = writeln!(out, "  {}: {}", e.unit, e.message);
        }
        if report.errors.len() > 20 {
            let _ = writeln!(out, "  ... and {} more (see report file)", report.errors.len() - 20);
        }
    }

    out
}

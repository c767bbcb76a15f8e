// Import driver for the destination photo application
//
// One osxphotos invocation per item by default, serialized: the destination
// application is a single stateful process. Every album of an item is passed
// in the same invocation so multi-album membership lands in one operation.
// The batch strategy lives in `batch`.

pub mod batch;

use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use crate::constants::{APP_UNAVAILABLE_MARKERS, DUPLICATE_MARKERS};
use crate::error::Result;
use crate::metadata::exiftool::excerpt;
use crate::tools::{run_command_line, CommandRunner, ToolOutput};
use batch::{build_batch_args, interpret_batch, BatchOutcome, ImportBatch};

/// One item to import.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub item_id: String,
    pub path: PathBuf,
    /// Destination album names; may be empty
    pub albums: Vec<String>,
}

/// Everything an import phase intends to import, written before it starts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportManifest {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<ImportRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported,
    /// Already in the destination library
    Duplicate,
    /// Destination application not reachable; retryable
    AppUnavailable(String),
    Failed(String),
}

impl ImportOutcome {
    /// Imported or already present.
    pub fn is_complete(&self) -> bool {
        matches!(self, ImportOutcome::Imported | ImportOutcome::Duplicate)
    }
}

pub fn build_args(request: &ImportRequest) -> Vec<String> {
    let mut args = vec!["import".to_string(), request.path.to_string_lossy().to_string()];
    for album in &request.albums {
        args.push("--album".to_string());
        args.push(album.clone());
    }
    args.push("--skip-dups".to_string());
    args.push("--verbose".to_string());
    args
}

/// Classify the tool's result for one request. A non-zero exit is never a
/// success: it is either the application being unreachable or a failure.
/// Duplicate notices count only on a zero exit, and are looked for after the
/// request's own path and album names are removed from the output.
pub fn interpret(output: &ToolOutput, request: &ImportRequest) -> ImportOutcome {
    let combined = output.combined();
    if !output.success() {
        return match unavailable_reason(output) {
            Some(reason) => ImportOutcome::AppUnavailable(reason),
            None => ImportOutcome::Failed(excerpt(&combined)),
        };
    }

    let mut scrubbed = combined.replace(request.path.to_string_lossy().as_ref(), "");
    for album in &request.albums {
        scrubbed = scrubbed.replace(album.as_str(), "");
    }
    let lower = scrubbed.to_lowercase();
    if DUPLICATE_MARKERS.iter().any(|m| lower.contains(m)) {
        ImportOutcome::Duplicate
    } else {
        ImportOutcome::Imported
    }
}

/// Excerpt of a failed run's output when it says the destination is unreachable.
pub fn unavailable_reason(output: &ToolOutput) -> Option<String> {
    let combined = output.combined();
    let lower = combined.to_lowercase();
    APP_UNAVAILABLE_MARKERS
        .iter()
        .any(|m| lower.contains(m))
        .then(|| excerpt(&combined))
}

pub struct ImportDriver<'a> {
    runner: &'a dyn CommandRunner,
    tool: PathBuf,
    health_command: Option<Vec<String>>,
    restart_command: Option<Vec<String>>,
}

impl<'a> ImportDriver<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        tool: &Path,
        health_command: Option<Vec<String>>,
        restart_command: Option<Vec<String>>,
    ) -> Self {
        Self {
            runner,
            tool: tool.to_path_buf(),
            health_command,
            restart_command,
        }
    }

    pub fn import(&self, request: &ImportRequest) -> ImportOutcome {
        let args = build_args(request);
        log::debug!("Importing {} into {:?}", request.path.display(), request.albums);
        match self.runner.run(&self.tool, &args) {
            Ok(output) => interpret(&output, request),
            Err(e) => ImportOutcome::Failed(format!("Failed to run import tool: {}", e)),
        }
    }

    /// Import a whole batch in one invocation, reading results from `report`.
    pub fn import_batch(&self, batch: &ImportBatch, report: &Path) -> BatchOutcome {
        if report.exists() {
            if let Err(e) = std::fs::remove_file(report) {
                log::warn!("Could not remove old import report {}: {}", report.display(), e);
            }
        }
        let args = build_batch_args(batch, report);
        log::debug!("Importing {} files into {:?}", batch.requests.len(), batch.albums);
        match self.runner.run(&self.tool, &args) {
            Ok(output) => interpret_batch(batch, &output, report),
            Err(e) => {
                let message = format!("Failed to run import tool: {}", e);
                BatchOutcome::Done(vec![ImportOutcome::Failed(message); batch.requests.len()])
            }
        }
    }

    /// Whether a health check is configured at all.
    pub fn has_health_check(&self) -> bool {
        self.health_command.is_some()
    }

    /// Run the health check. Without one the destination counts as reachable.
    pub fn is_available(&self) -> bool {
        match &self.health_command {
            Some(command) => run_command_line(self.runner, command),
            None => true,
        }
    }

    /// Run the restart hook, if configured.
    pub fn restart(&self) -> bool {
        match &self.restart_command {
            Some(command) => {
                log::warn!("Restarting destination application");
                run_command_line(self.runner, command)
            }
            None => false,
        }
    }
}

pub fn write_manifest(path: &Path, manifest: &ImportManifest) -> Result<()> {
    crate::pipeline::state::write_json_atomic(path, manifest)
}

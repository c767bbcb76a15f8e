// Batch import: many files per import tool invocation
//
// Items are grouped by their album list so every file in one invocation gets
// the same --album flags. The tool writes a JSON report of what it did with
// each file; that report, not the console output, decides each item's result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use serde::Deserialize;
use serde_json::Value;
use crate::error::Result;
use crate::metadata::exiftool::excerpt;
use crate::tools::ToolOutput;
use super::{unavailable_reason, ImportOutcome, ImportRequest};

/// Files imported together into the same albums.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportBatch {
    pub albums: Vec<String>,
    pub requests: Vec<ImportRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// One outcome per request, in request order
    Done(Vec<ImportOutcome>),
    AppUnavailable(String),
}

/// One row of the import tool's report.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportEntry {
    pub filepath: Option<String>,
    pub filename: Option<String>,
    pub imported: Value,
    pub error: Value,
}

impl ReportEntry {
    fn outcome(&self) -> ImportOutcome {
        if truthy(&self.imported) {
            ImportOutcome::Imported
        } else if has_error(&self.error) {
            let detail = match &self.error {
                Value::String(s) if !truthy(&self.error) => s.clone(),
                _ => "import tool reported an error".to_string(),
            };
            ImportOutcome::Failed(detail)
        } else {
            // neither imported nor failed: left out by --skip-dups
            ImportOutcome::Duplicate
        }
    }
}

/// Report flags show up as booleans, numbers or strings.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|n| n != 0).unwrap_or(false),
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "imported"),
        _ => false,
    }
}

/// The error column may also carry the message itself.
fn has_error(value: &Value) -> bool {
    match value {
        Value::String(s) => !matches!(s.trim().to_lowercase().as_str(), "" | "false" | "0" | "no" | "none"),
        other => truthy(other),
    }
}

/// Group requests by album list, first appearance first, and split each group
/// into chunks of at most `size` files.
pub fn plan_batches(requests: &[ImportRequest], size: usize) -> Vec<ImportBatch> {
    let size = size.max(1);
    let mut order: Vec<Vec<String>> = Vec::new();
    let mut groups: BTreeMap<Vec<String>, Vec<ImportRequest>> = BTreeMap::new();
    for request in requests {
        let group = groups.entry(request.albums.clone()).or_insert_with(|| {
            order.push(request.albums.clone());
            Vec::new()
        });
        group.push(request.clone());
    }

    let mut batches = Vec::new();
    for albums in order {
        let Some(members) = groups.remove(&albums) else { continue };
        for chunk in members.chunks(size) {
            batches.push(ImportBatch {
                albums: albums.clone(),
                requests: chunk.to_vec(),
            });
        }
    }
    batches
}

pub fn build_batch_args(batch: &ImportBatch, report: &Path) -> Vec<String> {
    let mut args = vec!["import".to_string()];
    args.extend(batch.requests.iter().map(|r| r.path.to_string_lossy().to_string()));
    for album in &batch.albums {
        args.push("--album".to_string());
        args.push(album.clone());
    }
    args.push("--skip-dups".to_string());
    args.push("--verbose".to_string());
    args.push("--report".to_string());
    args.push(report.to_string_lossy().to_string());
    args
}

pub fn read_report(path: &Path) -> Result<Vec<ReportEntry>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Pair every request with its report row. Rows are found by full path,
/// then by file name when that name is unique in the batch.
pub fn outcomes_from_report(batch: &ImportBatch, entries: &[ReportEntry]) -> Vec<ImportOutcome> {
    let mut by_path: BTreeMap<PathBuf, &ReportEntry> = BTreeMap::new();
    let mut by_name: BTreeMap<String, Vec<&ReportEntry>> = BTreeMap::new();
    for entry in entries {
        if let Some(path) = &entry.filepath {
            by_path.insert(PathBuf::from(path), entry);
        }
        let name = entry.filename.clone().or_else(|| {
            entry
                .filepath
                .as_deref()
                .and_then(|p| Path::new(p).file_name())
                .map(|n| n.to_string_lossy().to_string())
        });
        if let Some(name) = name {
            by_name.entry(name).or_default().push(entry);
        }
    }

    let mut name_counts: BTreeMap<String, usize> = BTreeMap::new();
    for request in &batch.requests {
        *name_counts.entry(file_name(&request.path)).or_insert(0) += 1;
    }

    batch
        .requests
        .iter()
        .map(|request| {
            let name = file_name(&request.path);
            let row = by_path.get(&request.path).copied().or_else(|| {
                match (name_counts.get(&name), by_name.get(&name)) {
                    (Some(1), Some(rows)) if rows.len() == 1 => Some(rows[0]),
                    _ => None,
                }
            });
            match row {
                Some(row) => row.outcome(),
                None => ImportOutcome::Failed("missing from the import report".to_string()),
            }
        })
        .collect()
}

/// Turn one finished invocation into per-request outcomes.
pub fn interpret_batch(batch: &ImportBatch, output: &ToolOutput, report: &Path) -> BatchOutcome {
    if !output.success() {
        if let Some(reason) = unavailable_reason(output) {
            return BatchOutcome::AppUnavailable(reason);
        }
    }

    match read_report(report) {
        Ok(entries) => BatchOutcome::Done(outcomes_from_report(batch, &entries)),
        Err(e) => {
            let message = if output.success() {
                format!("import report unreadable: {}", e)
            } else {
                excerpt(&output.combined())
            };
            BatchOutcome::Done(vec![ImportOutcome::Failed(message); batch.requests.len()])
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn req(id: &str, path: &str, albums: &[&str]) -> ImportRequest {
        ImportRequest {
            item_id: id.to_string(),
            path: PathBuf::from(path),
            albums: albums.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn test_plan_groups_by_albums_and_chunks() {
        let requests = vec![
            req("1", "/out/Trip/a.jpg", &["Trip"]),
            req("2", "/out/2023/b.jpg", &[]),
            req("3", "/out/Trip/c.jpg", &["Trip"]),
            req("4", "/out/Trip/d.jpg", &["Trip"]),
            req("5", "/out/Trip/e.jpg", &["Trip", "Family"]),
        ];
        let batches = plan_batches(&requests, 2);
        let shape: Vec<(Vec<String>, Vec<&str>)> = batches
            .iter()
            .map(|b| (b.albums.clone(), b.requests.iter().map(|r| r.item_id.as_str()).collect()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (vec!["Trip".to_string()], vec!["1", "3"]),
                (vec!["Trip".to_string()], vec!["4"]),
                (vec![], vec!["2"]),
                (vec!["Trip".to_string(), "Family".to_string()], vec!["5"]),
            ]
        );
    }

    #[test]
    fn test_batch_args() {
        let batch = ImportBatch {
            albums: vec!["Trip".to_string(), "Family".to_string()],
            requests: vec![req("1", "/out/Trip/a.jpg", &[]), req("2", "/out/Trip/b.jpg", &[])],
        };
        assert_eq!(
            build_batch_args(&batch, Path::new("/state/report.json")),
            vec![
                "import", "/out/Trip/a.jpg", "/out/Trip/b.jpg", "--album", "Trip", "--album", "Family",
                "--skip-dups", "--verbose", "--report", "/state/report.json",
            ]
        );
    }

    #[test]
    fn test_report_rows_decide_each_item() {
        let batch = ImportBatch {
            albums: vec![],
            requests: vec![
                req("1", "/out/a.jpg", &[]),
                req("2", "/out/b.jpg", &[]),
                req("3", "/out/c.jpg", &[]),
                req("4", "/out/d.jpg", &[]),
                req("5", "/out/e.jpg", &[]),
            ],
        };
        let entries: Vec<ReportEntry> = serde_json::from_str(
            r#"[
                {"filepath": "/out/a.jpg", "filename": "a.jpg", "imported": true, "error": false},
                {"filepath": "/out/b.jpg", "filename": "b.jpg", "imported": false, "error": false},
                {"filepath": "/out/c.jpg", "filename": "c.jpg", "imported": false, "error": true},
                {"filename": "d.jpg", "imported": "1"}
            ]"#,
        )
        .unwrap();

        let outcomes = outcomes_from_report(&batch, &entries);
        assert_eq!(outcomes[0], ImportOutcome::Imported);
        assert_eq!(outcomes[1], ImportOutcome::Duplicate);
        assert!(matches!(outcomes[2], ImportOutcome::Failed(_)));
        assert_eq!(outcomes[3], ImportOutcome::Imported);
        assert!(matches!(outcomes[4], ImportOutcome::Failed(ref m) if m.contains("missing")));
    }

    #[test]
    fn test_same_file_name_needs_full_path() {
        let batch = ImportBatch {
            albums: vec![],
            requests: vec![req("1", "/out/Trip/IMG_1.jpg", &[]), req("2", "/out/Family/IMG_1.jpg", &[])],
        };
        let entries: Vec<ReportEntry> =
            serde_json::from_str(r#"[{"filename": "IMG_1.jpg", "imported": true}]"#).unwrap();
        let outcomes = outcomes_from_report(&batch, &entries);
        assert!(outcomes.iter().all(|o| matches!(o, ImportOutcome::Failed(_))));
    }

    #[test]
    fn test_interpret_batch() {
        let tmp = TempDir::new().unwrap();
        let report = tmp.path().join("report.json");
        let batch = ImportBatch {
            albums: vec![],
            requests: vec![req("1", "/out/a.jpg", &[])],
        };

        let unavailable = ToolOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "Error: Photos is not running".to_string(),
        };
        assert!(matches!(interpret_batch(&batch, &unavailable, &report), BatchOutcome::AppUnavailable(_)));

        let crashed = ToolOutput {
            code: Some(2),
            stdout: String::new(),
            stderr: "Traceback".to_string(),
        };
        assert_eq!(
            interpret_batch(&batch, &crashed, &report),
            BatchOutcome::Done(vec![ImportOutcome::Failed("Traceback".to_string())])
        );

        std::fs::write(&report, r#"[{"filepath": "/out/a.jpg", "imported": true}]"#).unwrap();
        let ok = ToolOutput {
            code: Some(0),
            ..Default::default()
        };
        assert_eq!(
            interpret_batch(&batch, &ok, &report),
            BatchOutcome::Done(vec![ImportOutcome::Imported])
        );
    }
}

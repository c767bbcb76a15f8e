// Metadata embedding: stage each item into the output tree and write its
// sidecar fields into the copy with exiftool

pub mod exiftool;
pub mod stage;

use std::path::{Path, PathBuf};
use chrono::{DateTime, FixedOffset, Utc};
use crate::catalog::MediaItem;
use crate::error::{MigrateError, Result};
use crate::tools::CommandRunner;

/// What embedding one item will do. Built without side effects, so a dry
/// run can report it.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedPlan {
    pub output: PathBuf,
    /// Full exiftool argument list; None when there is nothing to write
    pub exiftool_args: Option<Vec<String>>,
    pub capture_time: Option<DateTime<Utc>>,
}

impl EmbedPlan {
    pub fn writes_tags(&self) -> bool {
        self.exiftool_args.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedOutcome {
    /// Sidecar fields written into the copy
    Embedded,
    /// Copied without tags (unmatched, or sidecar had nothing to write)
    Staged,
}

pub struct Embedder<'a> {
    runner: &'a dyn CommandRunner,
    exiftool: PathBuf,
    output_dir: PathBuf,
    utc_offset: Option<FixedOffset>,
}

impl<'a> Embedder<'a> {
    pub fn new(runner: &'a dyn CommandRunner, exiftool: &Path, output_dir: &Path, utc_offset: Option<FixedOffset>) -> Self {
        Self {
            runner,
            exiftool: exiftool.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            utc_offset,
        }
    }

    pub fn output_path(&self, item: &MediaItem) -> PathBuf {
        output_path(&self.output_dir, item)
    }

    pub fn plan(&self, item: &MediaItem, is_video: bool) -> EmbedPlan {
        let output = self.output_path(item);
        let tags = item
            .sidecar
            .as_ref()
            .map(|record| exiftool::tag_args(record, is_video, self.utc_offset))
            .unwrap_or_default();
        let exiftool_args = if tags.is_empty() {
            None
        } else {
            Some(exiftool::build_args(&output, &tags, is_video))
        };
        EmbedPlan {
            output,
            exiftool_args,
            capture_time: item.sidecar.as_ref().and_then(|s| s.taken_at),
        }
    }

    /// Copy the item into the output tree and write its tags.
    /// On failure the partial output is removed.
    pub fn apply(&self, item: &MediaItem, plan: &EmbedPlan) -> Result<EmbedOutcome> {
        stage::stage_file(&item.file, &plan.output)?;

        let result = self.write(plan);
        if result.is_err() {
            let _ = std::fs::remove_file(&plan.output);
        }
        result
    }

    fn write(&self, plan: &EmbedPlan) -> Result<EmbedOutcome> {
        let outcome = match &plan.exiftool_args {
            Some(args) => {
                exiftool::write_tags(self.runner, &self.exiftool, args)?;
                EmbedOutcome::Embedded
            }
            None => EmbedOutcome::Staged,
        };

        if let Some(taken_at) = plan.capture_time {
            stage::set_capture_mtime(&plan.output, taken_at)
                .map_err(|e| MigrateError::Embed(format!("could not set file time: {}", e)))?;
        }
        Ok(outcome)
    }
}

/// Location of an item in the output tree.
pub fn output_path(output_dir: &Path, item: &MediaItem) -> PathBuf {
    item.output_rel
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(output_dir.to_path_buf(), |path, part| path.join(part))
}

// Archive extraction
//
// Each archive extracts into its own subtree `<work_dir>/<stem>/` so equal
// relative paths in different archives never collide. Extraction goes to a
// hidden `.<stem>.partial/` directory that is renamed into place only after
// every entry and the `.extracted` marker were written.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use crate::constants::{ARCHIVE_EXTENSIONS, EXTRACTED_MARKER, PARTIAL_PREFIX, PARTIAL_SUFFIX};
use crate::error::{MigrateError, Result};

/// A source archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    /// File name, used as the archive part of unit ids
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Written into the subtree once extraction completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionMarker {
    pub archive: String,
    pub fingerprint: String,
    pub files: usize,
    pub bytes: u64,
    pub extracted_at: DateTime<Utc>,
}

/// List archives in the source directory, sorted by name.
pub fn list_archives(source_dir: &Path) -> Result<Vec<ArchiveInfo>> {
    let mut archives = Vec::new();
    for entry in fs::read_dir(source_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_archive = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| ARCHIVE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false);
        if !is_archive {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        archives.push(ArchiveInfo {
            name,
            size: entry.metadata()?.len(),
            path,
        });
    }
    archives.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(archives)
}

/// Name of the subtree an archive extracts to (file name without extension).
pub fn subtree_name(archive_name: &str) -> String {
    match archive_name.rfind('.') {
        Some(dot) if dot > 0 => archive_name[..dot].to_string(),
        _ => archive_name.to_string(),
    }
}

pub fn subtree_dir(work_dir: &Path, archive_name: &str) -> PathBuf {
    work_dir.join(subtree_name(archive_name))
}

fn partial_dir(work_dir: &Path, archive_name: &str) -> PathBuf {
    work_dir.join(format!("{}{}{}", PARTIAL_PREFIX, subtree_name(archive_name), PARTIAL_SUFFIX))
}

/// Marker of a completed extraction, if any.
pub fn read_marker(work_dir: &Path, archive_name: &str) -> Option<ExtractionMarker> {
    let path = subtree_dir(work_dir, archive_name).join(EXTRACTED_MARKER);
    let contents = fs::read(path).ok()?;
    serde_json::from_slice(&contents).ok()
}

pub fn is_extracted(work_dir: &Path, archive_name: &str) -> bool {
    read_marker(work_dir, archive_name).is_some()
}

/// Markers of every completed subtree in the working directory, by archive name.
pub fn extracted_archives(work_dir: &Path) -> Result<Vec<ExtractionMarker>> {
    let mut markers = Vec::new();
    if !work_dir.is_dir() {
        return Ok(markers);
    }
    for entry in fs::read_dir(work_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let marker_path = entry.path().join(EXTRACTED_MARKER);
        let Ok(contents) = fs::read(&marker_path) else {
            continue;
        };
        match serde_json::from_slice::<ExtractionMarker>(&contents) {
            Ok(marker) => markers.push(marker),
            Err(e) => log::warn!("Ignoring unreadable marker {}: {}", marker_path.display(), e),
        }
    }
    markers.sort_by(|a, b| a.archive.cmp(&b.archive));
    Ok(markers)
}

/// Extract one archive into its subtree. Never modifies the archive.
/// Any failure leaves no subtree behind and is returned as `Archive`.
pub fn extract_archive(archive: &ArchiveInfo, work_dir: &Path, fingerprint: &str) -> Result<ExtractionMarker> {
    let partial = partial_dir(work_dir, &archive.name);
    let result = extract_into(archive, &partial, fingerprint).and_then(|marker| {
        let target = subtree_dir(work_dir, &archive.name);
        if target.exists() {
            // leftover without a marker from an older, interrupted layout
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&partial, &target)?;
        Ok(marker)
    });

    match result {
        Ok(marker) => Ok(marker),
        Err(e) => {
            let _ = fs::remove_dir_all(&partial);
            Err(match e {
                MigrateError::Archive { .. } => e,
                other => MigrateError::Archive {
                    archive: archive.name.clone(),
                    reason: other.to_string(),
                },
            })
        }
    }
}

fn extract_into(archive: &ArchiveInfo, partial: &Path, fingerprint: &str) -> Result<ExtractionMarker> {
    if partial.exists() {
        log::info!("Removing stale partial extraction {}", partial.display());
        fs::remove_dir_all(partial)?;
    }
    fs::create_dir_all(partial)?;

    let mut zip = zip::ZipArchive::new(File::open(&archive.path)?)?;
    let mut files = 0usize;
    let mut bytes = 0u64;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            log::warn!("Skipping unsafe entry {} in {}", entry.name(), archive.name);
            continue;
        };
        let dest = partial.join(&rel);

        if entry.is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&dest)?;
        bytes += io::copy(&mut entry, &mut out)?;
        drop(out);
        files += 1;

        if let Some(mtime) = entry.last_modified().and_then(zip_time_to_unix) {
            let _ = filetime::set_file_mtime(&dest, filetime::FileTime::from_unix_time(mtime, 0));
        }
    }

    let marker = ExtractionMarker {
        archive: archive.name.clone(),
        fingerprint: fingerprint.to_string(),
        files,
        bytes,
        extracted_at: Utc::now(),
    };
    let json = serde_json::to_vec_pretty(&marker)?;
    fs::write(partial.join(EXTRACTED_MARKER), json)?;

    log::info!("Extracted {} ({} files, {} bytes)", archive.name, files, bytes);
    Ok(marker)
}

fn zip_time_to_unix(t: zip::DateTime) -> Option<i64> {
    NaiveDate::from_ymd_opt(t.year() as i32, t.month() as u32, t.day() as u32)?
        .and_hms_opt(t.hour() as u32, t.minute() as u32, t.second() as u32)
        .map(|dt| dt.and_utc().timestamp())
}

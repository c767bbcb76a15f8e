// Copying media into the output tree
//
// Copies land under a temporary name and are renamed once complete, so the
// output tree never holds a half-written file under its final name.

use std::fs;
use std::io::Write;
use std::path::Path;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use crate::catalog::discover::{DiscoveredFile, FileSource};
use crate::constants::TEMP_FILE_PREFIX;
use crate::error::{MigrateError, Result};

/// Copy a discovered file to `dest`, keeping its modification time.
/// Returns the number of bytes written.
pub fn stage_file(file: &DiscoveredFile, dest: &Path) -> Result<u64> {
    let parent = dest
        .parent()
        .ok_or_else(|| MigrateError::InvalidPath(dest.display().to_string()))?;
    fs::create_dir_all(parent)?;

    let file_name = dest
        .file_name()
        .ok_or_else(|| MigrateError::InvalidPath(dest.display().to_string()))?;
    let tmp_path = parent.join(format!("{}{}", TEMP_FILE_PREFIX, file_name.to_string_lossy()));

    let written = match &file.source {
        FileSource::Disk(source) => {
            let written = fs::copy(source, &tmp_path)?;
            fs::File::open(&tmp_path)?.sync_all()?;
            if let Ok(modified) = fs::metadata(source).and_then(|m| m.modified()) {
                let _ = filetime::set_file_mtime(&tmp_path, FileTime::from_system_time(modified));
            }
            written
        }
        _ => {
            let bytes = file.read_bytes()?;
            let mut out = fs::File::create(&tmp_path)?;
            out.write_all(&bytes)?;
            out.sync_all()?;
            bytes.len() as u64
        }
    };

    if written != file.size {
        let _ = fs::remove_file(&tmp_path);
        return Err(MigrateError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("size mismatch copying {} ({} vs {})", file.unit_id(), written, file.size),
        )));
    }

    fs::rename(&tmp_path, dest)?;
    Ok(written)
}

/// Set a file's modification time to the capture time.
pub fn set_capture_mtime(path: &Path, taken_at: DateTime<Utc>) -> Result<()> {
    filetime::set_file_mtime(path, FileTime::from_unix_time(taken_at.timestamp(), 0))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::discover::FileClass;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn disk_file(path: PathBuf, size: u64) -> DiscoveredFile {
        DiscoveredFile {
            archive: "a.zip".to_string(),
            rel_path: "Trip/a.jpg".to_string(),
            size,
            class: FileClass::Media,
            source: FileSource::Disk(path),
        }
    }

    #[test]
    fn test_stage_preserves_mtime() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("a.jpg");
        fs::write(&source, b"jpeg data").unwrap();
        filetime::set_file_mtime(&source, FileTime::from_unix_time(1_500_000_000, 0)).unwrap();

        let dest = tmp.path().join("out/Trip/a.jpg");
        let written = stage_file(&disk_file(source, 9), &dest).unwrap();
        assert_eq!(written, 9);
        assert_eq!(fs::read(&dest).unwrap(), b"jpeg data");

        let meta = fs::metadata(&dest).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 1_500_000_000);
        assert!(!tmp.path().join("out/Trip/.tmp_a.jpg").exists());
    }

    #[test]
    fn test_stage_from_memory() {
        let tmp = TempDir::new().unwrap();
        let file = DiscoveredFile {
            source: FileSource::Memory(std::sync::Arc::new(b"abc".to_vec())),
            ..disk_file(PathBuf::new(), 3)
        };
        let dest = tmp.path().join("x/a.jpg");
        stage_file(&file, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"abc");
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("a.jpg");
        fs::write(&source, b"short").unwrap();
        let dest = tmp.path().join("out/a.jpg");
        assert!(stage_file(&disk_file(source, 99), &dest).is_err());
        assert!(!dest.exists());
    }

    #[test]
    fn test_capture_mtime() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.jpg");
        fs::write(&path, b"x").unwrap();
        let taken = DateTime::<Utc>::from_timestamp(1672574400, 0).unwrap();
        set_capture_mtime(&path, taken).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 1672574400);
    }
}

// File discovery for the working tree
//
// Files come either from an extracted archive subtree on disk or, during a dry
// run over archives that were never extracted, straight from the zip listing.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;
use crate::constants::{
    ALBUM_METADATA_NAMES, IMAGE_EXTENSIONS, NON_ITEM_JSON, SIDECAR_EXTENSION, UNIT_SEPARATOR,
    VIDEO_EXTENSIONS,
};
use crate::error::{MigrateError, Result};
use crate::hash::{compute_fast_hash, compute_fast_hash_bytes};

/// Lower-case extensions (without dot) treated as media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaExtensions {
    pub image: Vec<String>,
    pub video: Vec<String>,
}

impl Default for MediaExtensions {
    fn default() -> Self {
        Self {
            image: IMAGE_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            video: VIDEO_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl MediaExtensions {
    pub fn is_media(&self, file_name: &str) -> bool {
        match extension_of(file_name) {
            Some(ext) => self.image.contains(&ext) || self.video.contains(&ext),
            None => false,
        }
    }

    pub fn is_video(&self, file_name: &str) -> bool {
        extension_of(file_name)
            .map(|ext| self.video.contains(&ext))
            .unwrap_or(false)
    }
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    Media,
    Sidecar,
    AlbumMetadata,
    Ignored,
}

/// Classify a file by name.
pub fn classify(file_name: &str, extensions: &MediaExtensions) -> FileClass {
    let lower = file_name.to_lowercase();
    if extension_of(&lower).as_deref() == Some(SIDECAR_EXTENSION) {
        if NON_ITEM_JSON.contains(&lower.as_str()) {
            return FileClass::Ignored;
        }
        if ALBUM_METADATA_NAMES.contains(&lower.as_str()) {
            return FileClass::AlbumMetadata;
        }
        return FileClass::Sidecar;
    }
    if extensions.is_media(&lower) {
        FileClass::Media
    } else {
        FileClass::Ignored
    }
}

/// Where a discovered file's bytes live.
#[derive(Debug, Clone)]
pub enum FileSource {
    Disk(PathBuf),
    ArchiveEntry { archive: PathBuf, entry: String },
    Memory(Arc<Vec<u8>>),
}

#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Archive file name ("takeout-001.zip")
    pub archive: String,
    /// Path inside the archive, '/'-separated
    pub rel_path: String,
    pub size: u64,
    pub class: FileClass,
    pub source: FileSource,
}

impl DiscoveredFile {
    /// Stable identifier: archive name + relative path.
    pub fn unit_id(&self) -> String {
        unit_id(&self.archive, &self.rel_path)
    }

    pub fn file_name(&self) -> &str {
        self.rel_path.rsplit(UNIT_SEPARATOR).next().unwrap_or(&self.rel_path)
    }

    pub fn disk_path(&self) -> Option<&Path> {
        match &self.source {
            FileSource::Disk(p) => Some(p),
            _ => None,
        }
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        match &self.source {
            FileSource::Disk(p) => Ok(std::fs::read(p)?),
            FileSource::Memory(bytes) => Ok(bytes.as_ref().clone()),
            FileSource::ArchiveEntry { archive, entry } => {
                let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
                let mut file = zip.by_name(entry)?;
                let mut buffer = Vec::with_capacity(file.size() as usize);
                file.read_to_end(&mut buffer)?;
                Ok(buffer)
            }
        }
    }

    pub fn fast_hash(&self) -> Result<String> {
        match &self.source {
            FileSource::Disk(p) => compute_fast_hash(p),
            _ => Ok(compute_fast_hash_bytes(&self.read_bytes()?)),
        }
    }
}

pub fn unit_id(archive: &str, rel_path: &str) -> String {
    format!("{}{}{}", archive, UNIT_SEPARATOR, rel_path)
}

/// Discover media, sidecar and album metadata files in an extracted archive subtree.
pub fn discover_extracted(archive: &str, root: &Path, extensions: &MediaExtensions) -> Result<Vec<DiscoveredFile>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name().to_str().unwrap_or("")))
    {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .map_err(|_| MigrateError::InvalidPath(path.display().to_string()))?;
        let rel_path = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");

        let class = classify(&file_name_of(&rel_path), extensions);
        if class == FileClass::Ignored {
            continue;
        }

        files.push(DiscoveredFile {
            archive: archive.to_string(),
            rel_path,
            size: entry.metadata().map(|m| m.len()).unwrap_or(0),
            class,
            source: FileSource::Disk(path.to_path_buf()),
        });
    }

    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}

/// Discover files straight from an archive without extracting it.
/// Sidecars are read into memory; media stay as entry references.
pub fn discover_in_archive(archive: &str, archive_path: &Path, extensions: &MediaExtensions) -> Result<Vec<DiscoveredFile>> {
    let mut zip = zip::ZipArchive::new(File::open(archive_path)?)?;
    let mut files = Vec::new();

    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let Some(safe) = file.enclosed_name() else {
            log::warn!("Skipping unsafe entry {} in {}", file.name(), archive);
            continue;
        };
        let rel_path = safe
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        if rel_path.split('/').any(is_hidden) {
            continue;
        }

        let class = classify(&file_name_of(&rel_path), extensions);
        let source = match class {
            FileClass::Ignored => continue,
            FileClass::Media => FileSource::ArchiveEntry {
                archive: archive_path.to_path_buf(),
                entry: file.name().to_string(),
            },
            FileClass::Sidecar | FileClass::AlbumMetadata => {
                let mut buffer = Vec::with_capacity(file.size() as usize);
                file.read_to_end(&mut buffer)?;
                FileSource::Memory(Arc::new(buffer))
            }
        };

        files.push(DiscoveredFile {
            archive: archive.to_string(),
            rel_path,
            size: file.size(),
            class,
            source,
        });
    }

    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}

fn file_name_of(rel_path: &str) -> String {
    rel_path.rsplit('/').next().unwrap_or(rel_path).to_string()
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_classify() {
        let exts = MediaExtensions::default();
        assert_eq!(classify("IMG_0001.JPG", &exts), FileClass::Media);
        assert_eq!(classify("clip.mov", &exts), FileClass::Media);
        assert_eq!(classify("IMG_0001.JPG.json", &exts), FileClass::Sidecar);
        assert_eq!(classify("metadata.json", &exts), FileClass::AlbumMetadata);
        assert_eq!(classify("print-subscriptions.json", &exts), FileClass::Ignored);
        assert_eq!(classify("archive_browser.html", &exts), FileClass::Ignored);
        assert!(exts.is_video("clip.MP4"));
        assert!(!exts.is_video("photo.jpg"));
    }

    #[test]
    fn test_discover_extracted_skips_hidden_and_ignored() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("takeout-001");
        let album = root.join("Takeout/Google Photos/Trip");
        std::fs::create_dir_all(&album).unwrap();
        std::fs::write(root.join(".extracted"), b"").unwrap();
        std::fs::write(album.join("b.jpg"), b"bbb").unwrap();
        std::fs::write(album.join("a.jpg"), b"aa").unwrap();
        std::fs::write(album.join("a.jpg.json"), b"{}").unwrap();
        std::fs::write(album.join("index.html"), b"").unwrap();

        let files = discover_extracted("takeout-001.zip", &root, &MediaExtensions::default()).unwrap();
        let rels: Vec<_> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(rels, vec![
            "Takeout/Google Photos/Trip/a.jpg",
            "Takeout/Google Photos/Trip/a.jpg.json",
            "Takeout/Google Photos/Trip/b.jpg",
        ]);
        assert_eq!(files[0].unit_id(), "takeout-001.zip/Takeout/Google Photos/Trip/a.jpg");
        assert_eq!(files[0].size, 2);
        assert_eq!(files[1].class, FileClass::Sidecar);
    }

    #[test]
    fn test_discover_in_archive_matches_extracted_hash() {
        let tmp = TempDir::new().unwrap();
        let zip_path = tmp.path().join("t.zip");
        {
            let mut writer = zip::ZipWriter::new(File::create(&zip_path).unwrap());
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("Takeout/Google Photos/Trip/a.jpg", options).unwrap();
            writer.write_all(b"jpeg-bytes").unwrap();
            writer.start_file("Takeout/Google Photos/Trip/a.jpg.json", options).unwrap();
            writer.write_all(b"{\"title\":\"a.jpg\"}").unwrap();
            writer.finish().unwrap();
        }

        let files = discover_in_archive("t.zip", &zip_path, &MediaExtensions::default()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(matches!(files[0].source, FileSource::ArchiveEntry { .. }));
        assert!(matches!(files[1].source, FileSource::Memory(_)));
        assert_eq!(files[1].read_bytes().unwrap(), b"{\"title\":\"a.jpg\"}".to_vec());
        assert_eq!(files[0].fast_hash().unwrap(), compute_fast_hash_bytes(b"jpeg-bytes"));
    }
}

// Persisted pipeline state
//
// A single JSON document under `<work_dir>/.takeout-migrate/`. Every mutation
// goes through `StateStore`, which serializes writers with a mutex and writes
// the file via temp + fsync + rename. An exclusive lock file keeps a second
// run off the same working directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use crate::catalog::matching::MatchRule;
use crate::catalog::ItemStatus;
use crate::config::RunMode;
use crate::constants::{LOCK_FILENAME, STATE_FILENAME, STATE_VERSION, TEMP_FILE_PREFIX};
use crate::error::{MigrateError, RecordedError, Result};
use super::{Phase, Stage};

/// Unflushed mutations tolerated by `StateStore::record`.
const RECORD_FLUSH_EVERY: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    Extracted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecord {
    pub status: ArchiveStatus,
    pub fingerprint: Option<String>,
    pub files: usize,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub status: ItemStatus,
    /// Phases this item has finished
    #[serde(default)]
    pub completed: BTreeSet<Phase>,
    pub output: Option<String>,
    #[serde(default)]
    pub albums: Vec<String>,
    pub match_rule: Option<MatchRule>,
    pub error: Option<RecordedError>,
    #[serde(default)]
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl ItemRecord {
    pub fn new(status: ItemStatus) -> Self {
        Self {
            status,
            completed: BTreeSet::new(),
            output: None,
            albums: Vec::new(),
            match_rule: None,
            error: None,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub mode: RunMode,
    pub dry_run: bool,
    pub worker: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub version: u32,
    pub stage: Stage,
    #[serde(default)]
    pub phases_completed: BTreeSet<Phase>,
    /// Dry-run flag of the last run that touched this state
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub archives: BTreeMap<String, ArchiveRecord>,
    #[serde(default)]
    pub items: BTreeMap<String, ItemRecord>,
    pub last_run: Option<RunRecord>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            stage: Stage::Idle,
            phases_completed: BTreeSet::new(),
            dry_run: false,
            archives: BTreeMap::new(),
            items: BTreeMap::new(),
            last_run: None,
        }
    }
}

impl PipelineState {
    pub fn item_done(&self, id: &str, phase: Phase) -> bool {
        self.items
            .get(id)
            .map(|r| r.completed.contains(&phase))
            .unwrap_or(false)
    }

    pub fn archive_extracted(&self, name: &str) -> bool {
        self.archives
            .get(name)
            .map(|r| r.status == ArchiveStatus::Extracted)
            .unwrap_or(false)
    }

    /// Get or create the record of an item.
    pub fn item_mut(&mut self, id: &str, initial: ItemStatus) -> &mut ItemRecord {
        self.items
            .entry(id.to_string())
            .or_insert_with(|| ItemRecord::new(initial))
    }

    pub fn status_counts(&self) -> BTreeMap<ItemStatus, usize> {
        let mut counts = BTreeMap::new();
        for record in self.items.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }
}

/// Path of the state file inside the state directory.
pub fn state_file(state_dir: &Path) -> PathBuf {
    state_dir.join(STATE_FILENAME)
}

/// Read the state file. Missing file is `None`; anything unreadable is
/// `StateCorruption`.
pub fn load_state(path: &Path) -> Result<Option<PipelineState>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let state: PipelineState = serde_json::from_slice(&bytes)
        .map_err(|e| MigrateError::StateCorruption(format!("{}: {}", path.display(), e)))?;
    if state.version != STATE_VERSION {
        return Err(MigrateError::StateCorruption(format!(
            "{}: unsupported state version {} (expected {})",
            path.display(),
            state.version,
            STATE_VERSION
        )));
    }
    Ok(Some(state))
}

/// Serialize to a temp file, fsync, then rename over the target.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| MigrateError::InvalidPath(path.display().to_string()))?;
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| MigrateError::InvalidPath(path.display().to_string()))?;
    let tmp_path = dir.join(format!("{}{}", TEMP_FILE_PREFIX, file_name.to_string_lossy()));

    let json = serde_json::to_vec_pretty(value)?;
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    // fsync the directory too (best-effort, not every platform allows it)
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

/// Exclusive lock on the state directory, released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    pub fn acquire(state_dir: &Path, holder: &str) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILENAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            let mut current = String::new();
            let _ = file.read_to_string(&mut current);
            let current = current.trim();
            return Err(MigrateError::LockHeld(if current.is_empty() {
                "another process".to_string()
            } else {
                current.to_string()
            }));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(holder.as_bytes())?;
        file.sync_all()?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}

struct Inner {
    state: PipelineState,
    pending: usize,
}

/// Single mutation point for pipeline state.
pub struct StateStore {
    path: PathBuf,
    persist: bool,
    inner: Mutex<Inner>,
}

impl StateStore {
    /// Load (or start) the state at `path`. With `persist` false nothing is
    /// ever written, which is how dry runs use it.
    pub fn open(path: &Path, persist: bool) -> Result<Self> {
        let state = load_state(path)?.unwrap_or_default();
        Ok(Self::with_state(path, state, persist))
    }

    pub fn with_state(path: &Path, state: PipelineState, persist: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            persist,
            inner: Mutex::new(Inner { state, pending: 0 }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> PipelineState {
        self.lock().state.clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&PipelineState) -> R) -> R {
        f(&self.lock().state)
    }

    /// Mutate and write through immediately.
    pub fn update<R>(&self, f: impl FnOnce(&mut PipelineState) -> R) -> Result<R> {
        let mut inner = self.lock();
        let result = f(&mut inner.state);
        self.write(&mut inner)?;
        Ok(result)
    }

    /// Mutate; written out every few calls and on `flush`.
    pub fn record<R>(&self, f: impl FnOnce(&mut PipelineState) -> R) -> Result<R> {
        let mut inner = self.lock();
        let result = f(&mut inner.state);
        inner.pending += 1;
        if inner.pending >= RECORD_FLUSH_EVERY {
            self.write(&mut inner)?;
        }
        Ok(result)
    }

    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        self.write(&mut inner)
    }

    fn write(&self, inner: &mut Inner) -> Result<()> {
        inner.pending = 0;
        if !self.persist {
            return Ok(());
        }
        write_json_atomic(&self.path, &inner.state)
    }
}

/// Move the state file aside. Returns where it went, if there was one.
pub fn reset_state(state_dir: &Path) -> Result<Option<PathBuf>> {
    let path = state_file(state_dir);
    if !path.exists() {
        return Ok(None);
    }
    let backup = state_dir.join(format!(
        "{}.{}.bak",
        STATE_FILENAME,
        Utc::now().format("%Y%m%dT%H%M%SZ")
    ));
    fs::rename(&path, &backup)?;
    Ok(Some(backup))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_state_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(load_state(&tmp.path().join("state.json")).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_state_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, b"{\"version\": 1, \"stage\": ").unwrap();
        let err = load_state(&path).unwrap_err();
        assert!(matches!(err, MigrateError::StateCorruption(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_wrong_version_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        let state = PipelineState { version: STATE_VERSION + 1, ..Default::default() };
        write_json_atomic(&path, &state).unwrap();
        assert!(matches!(load_state(&path), Err(MigrateError::StateCorruption(_))));
    }

    #[test]
    fn test_update_persists_and_reloads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        let store = StateStore::open(&path, true).unwrap();
        store
            .update(|s| {
                let item = s.item_mut("a.zip/x.jpg", ItemStatus::Matched);
                item.status = ItemStatus::Embedded;
                item.completed.insert(Phase::Metadata);
            })
            .unwrap();

        let reloaded = load_state(&path).unwrap().unwrap();
        assert!(reloaded.item_done("a.zip/x.jpg", Phase::Metadata));
        assert!(!reloaded.item_done("a.zip/x.jpg", Phase::Import));
        assert_eq!(reloaded.status_counts().get(&ItemStatus::Embedded), Some(&1));
        assert!(!tmp.path().join(".tmp_state.json").exists());
    }

    #[test]
    fn test_record_batches_until_flush() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        let store = StateStore::open(&path, true).unwrap();
        store.record(|s| s.dry_run = true).unwrap();
        assert!(!path.exists());
        store.flush().unwrap();
        assert!(load_state(&path).unwrap().unwrap().dry_run);
    }

    #[test]
    fn test_non_persistent_store_never_writes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        let store = StateStore::open(&path, false).unwrap();
        store.update(|s| s.stage = Stage::Done).unwrap();
        store.flush().unwrap();
        assert!(!path.exists());
        assert_eq!(store.read(|s| s.stage), Stage::Done);
    }

    #[test]
    fn test_second_lock_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let first = StateLock::acquire(tmp.path(), "host:1").unwrap();
        let err = StateLock::acquire(tmp.path(), "host:2").unwrap_err();
        assert!(matches!(err, MigrateError::LockHeld(ref holder) if holder == "host:1"));
        drop(first);
        assert!(StateLock::acquire(tmp.path(), "host:3").is_ok());
    }

    #[test]
    fn test_reset_moves_state_aside() {
        let tmp = TempDir::new().unwrap();
        assert!(reset_state(tmp.path()).unwrap().is_none());
        fs::write(state_file(tmp.path()), b"garbage").unwrap();
        let backup = reset_state(tmp.path()).unwrap().unwrap();
        assert!(backup.exists());
        assert!(!state_file(tmp.path()).exists());
    }
}

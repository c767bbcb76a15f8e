// Pipeline orchestrator
//
// Idle -> Extracting -> MetadataProcessing -> Importing -> Done, with Failed
// reachable from any phase on a fatal error. The run mode selects which
// phases execute. Every phase skips units already complete in the persisted
// state, so a stopped run picks up where it left off.

pub mod report;
pub mod state;


use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::archive::{self, ArchiveInfo};
use crate::catalog::discover::{discover_extracted, discover_in_archive, DiscoveredFile};
use crate::catalog::{build_catalog, Catalog, CatalogOptions, ItemStatus, MediaItem};
use crate::config::{ImportStrategy, Settings, UnavailablePolicy};
use crate::constants::{EXIT_INTERRUPTED, EXIT_OK, EXIT_PARTIAL, STATE_FOLDER};
use crate::error::{ErrorKind, MigrateError, RecordedError, Result};
use crate::hash::compute_fast_hash;
use crate::import::batch::{plan_batches, BatchOutcome, ImportBatch};
use crate::import::{write_manifest, ImportDriver, ImportManifest, ImportOutcome, ImportRequest};
use crate::jobs::progress::ProgressCounter;
use crate::jobs::{get_worker_id, run_bounded, CancelFlag};
use crate::metadata::{output_path, EmbedOutcome, Embedder};
use crate::tools::{check_tool_version, CommandRunner};
use report::{AlbumRow, ItemRow, PhaseSummary, RunReport};
use state::{ArchiveRecord, ArchiveStatus, PipelineState, RunRecord, StateLock, StateStore};

const MANIFEST_FILENAME: &str = "import-manifest.json";
const BATCH_REPORT_FILENAME: &str = "import-report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Extract,
    Metadata,
    Import,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Extract => "extract",
            Phase::Metadata => "metadata",
            Phase::Import => "import",
        }
    }

    fn stage(self) -> Stage {
        match self {
            Phase::Extract => Stage::Extracting,
            Phase::Metadata => Stage::MetadataProcessing,
            Phase::Import => Stage::Importing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Extracting,
    MetadataProcessing,
    Importing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Every selected unit completed
    Success,
    /// Finished, but some units failed and were recorded
    Partial,
    /// Stopped early; state is saved and the run can resume
    Interrupted,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Partial => "partial",
            RunOutcome::Interrupted => "interrupted",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Success => EXIT_OK,
            RunOutcome::Partial => EXIT_PARTIAL,
            RunOutcome::Interrupted => EXIT_INTERRUPTED,
        }
    }
}

/// Operator answer when the destination application is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorChoice {
    /// Retry; the operator started the application
    Continue,
    /// Run the restart hook, then retry
    Restart,
    Abort,
}

pub trait OperatorPrompt: Send + Sync {
    fn app_unavailable(&self, reason: &str) -> OperatorChoice;
}

/// Used when nobody is at the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortPrompt;

impl OperatorPrompt for AbortPrompt {
    fn app_unavailable(&self, _reason: &str) -> OperatorChoice {
        OperatorChoice::Abort
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub report: RunReport,
    /// None for dry runs
    pub report_path: Option<PathBuf>,
}

/// Directory holding state, lock, manifest and reports.
pub fn state_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(STATE_FOLDER)
}

/// Current persisted state, if any.
pub fn load_status(work_dir: &Path) -> Result<Option<PipelineState>> {
    state::load_state(&state::state_file(&state_dir(work_dir)))
}

/// Move the state file aside so the next run starts over. Takes the lock so a
/// running pipeline is never reset underneath.
pub fn reset(work_dir: &Path) -> Result<Option<PathBuf>> {
    let dir = state_dir(work_dir);
    let _lock = StateLock::acquire(&dir, &get_worker_id())?;
    state::reset_state(&dir)
}

/// Per-item scope after applying the album filter.
#[derive(Debug, Clone)]
struct ItemScope {
    in_scope: bool,
    /// Album names the item is imported into
    assignments: Vec<String>,
}

/// Accumulators for one run.
struct RunContext {
    run_id: String,
    started_at: DateTime<Utc>,
    phases: Vec<PhaseSummary>,
    errors: Vec<RecordedError>,
    failed_units: usize,
    interrupted: bool,
}

enum Recovery {
    Retry,
    Abort,
}

enum ExtractResult {
    AlreadyDone,
    Extracted,
    Failed(RecordedError),
}

pub struct Pipeline<'a> {
    settings: &'a Settings,
    runner: &'a dyn CommandRunner,
    prompt: &'a dyn OperatorPrompt,
    cancel: CancelFlag,
}

impl<'a> Pipeline<'a> {
    pub fn new(settings: &'a Settings, runner: &'a dyn CommandRunner, prompt: &'a dyn OperatorPrompt, cancel: CancelFlag) -> Self {
        Self {
            settings,
            runner,
            prompt,
            cancel,
        }
    }

    /// Execute the phases selected by the run mode.
    pub fn run(&self) -> Result<RunSummary> {
        let s = self.settings;
        s.validate()?;
        if !s.dry_run {
            self.check_tools()?;
        }

        let dir = state_dir(&s.work_dir);
        let _lock = if s.dry_run {
            None
        } else {
            Some(StateLock::acquire(&dir, &get_worker_id())?)
        };
        let store = StateStore::open(&state::state_file(&dir), !s.dry_run)?;

        let mut ctx = RunContext {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            phases: Vec::new(),
            errors: Vec::new(),
            failed_units: 0,
            interrupted: false,
        };
        log::info!(
            "Run {} started: mode={}, dry_run={}, work_dir={}",
            ctx.run_id,
            s.mode.as_str(),
            s.dry_run,
            s.work_dir.display()
        );

        store.update(|st| {
            st.dry_run = s.dry_run;
            st.last_run = Some(RunRecord {
                run_id: ctx.run_id.clone(),
                mode: s.mode,
                dry_run: s.dry_run,
                worker: get_worker_id(),
                started_at: ctx.started_at,
                finished_at: None,
                outcome: None,
            });
        })?;

        match self.run_phases(&store, &mut ctx) {
            Ok(catalog) => self.finish(&store, ctx, catalog.as_ref()),
            Err(e) => {
                log::error!("Run {} failed: {}", ctx.run_id, e);
                let recorded = store.update(|st| {
                    st.stage = Stage::Failed;
                    if let Some(run) = st.last_run.as_mut() {
                        run.finished_at = Some(Utc::now());
                        run.outcome = Some("failed".to_string());
                    }
                });
                if let Err(write_err) = recorded {
                    log::warn!("Could not record the failed run in the state file: {}", write_err);
                }
                Err(e)
            }
        }
    }

    fn check_tools(&self) -> Result<()> {
        let s = self.settings;
        if s.mode.includes(Phase::Metadata) {
            let version = check_tool_version(self.runner, &s.tools.exiftool, "-ver")?;
            log::info!("exiftool {} at {}", version, s.tools.exiftool.display());
        }
        if s.mode.includes(Phase::Import) {
            let version = check_tool_version(self.runner, &s.tools.import_tool, "--version")?;
            log::info!("import tool {} at {}", version, s.tools.import_tool.display());
        }
        Ok(())
    }

    fn run_phases(&self, store: &StateStore, ctx: &mut RunContext) -> Result<Option<Catalog>> {
        let s = self.settings;

        if s.mode.includes(Phase::Extract) {
            self.extract_phase(store, ctx)?;
        }
        if ctx.interrupted || !(s.mode.includes(Phase::Metadata) || s.mode.includes(Phase::Import)) {
            return Ok(None);
        }

        let files = self.collect_files(store, ctx)?;
        let catalog = build_catalog(files, &CatalogOptions::from_settings(s));
        let scope = self.resolve_scope(&catalog);
        if s.album_filter.is_scoped() {
            let kept = scope.iter().filter(|x| x.in_scope).count();
            log::info!("Album filter keeps {} of {} items", kept, catalog.items.len());
        }
        self.record_catalog_findings(&catalog, &scope, ctx);

        if s.mode.includes(Phase::Metadata) {
            self.metadata_phase(store, ctx, &catalog, &scope)?;
        }
        if !ctx.interrupted && s.mode.includes(Phase::Import) {
            self.import_phase(store, ctx, &catalog, &scope)?;
        }
        Ok(Some(catalog))
    }

    fn enter(&self, store: &StateStore, phase: Phase) -> Result<()> {
        log::info!("Phase {} started", phase.as_str());
        store.update(|st| st.stage = phase.stage())
    }

    fn leave(&self, store: &StateStore, ctx: &mut RunContext, summary: PhaseSummary) -> Result<()> {
        if self.cancel.is_cancelled() {
            ctx.interrupted = true;
        }
        let complete = !ctx.interrupted && summary.failed == 0;
        if let Some(phase) = summary.phase {
            log::info!(
                "Phase {} finished: {} total, {} done, {} already done, {} skipped, {} failed",
                phase.as_str(),
                summary.total,
                summary.processed,
                summary.already_done,
                summary.skipped,
                summary.failed
            );
            store.update(|st| {
                if complete {
                    st.phases_completed.insert(phase);
                } else {
                    st.phases_completed.remove(&phase);
                }
            })?;
        }
        ctx.failed_units += summary.failed;
        ctx.phases.push(summary);
        Ok(())
    }

    // --- Extract ---

    fn extract_phase(&self, store: &StateStore, ctx: &mut RunContext) -> Result<()> {
        let s = self.settings;
        self.enter(store, Phase::Extract)?;

        let archives = archive::list_archives(&s.source_dir)?;
        let mut summary = PhaseSummary::new(Phase::Extract);
        summary.total = archives.len();
        log::info!("Found {} archives in {}", archives.len(), s.source_dir.display());

        let progress = ProgressCounter::new("extract", archives.len());
        let results = run_bounded(s.workers, &archives, &self.cancel, |archive| {
            let result = self.extract_one(store, archive);
            progress.tick();
            result
        })?;

        for result in results {
            match result {
                None => ctx.interrupted = true,
                Some(Err(e)) => return Err(e),
                Some(Ok(ExtractResult::AlreadyDone)) => summary.already_done += 1,
                Some(Ok(ExtractResult::Extracted)) => summary.processed += 1,
                Some(Ok(ExtractResult::Failed(error))) => {
                    log::error!("Archive {} failed: {}", error.unit, error.message);
                    summary.failed += 1;
                    ctx.errors.push(error);
                }
            }
        }

        self.leave(store, ctx, summary)
    }

    /// Outer error: the state could not be written. Archive problems are
    /// returned as `ExtractResult::Failed`.
    fn extract_one(&self, store: &StateStore, archive: &ArchiveInfo) -> Result<ExtractResult> {
        let s = self.settings;
        let failed = |reason: String| ExtractResult::Failed(RecordedError::new(ErrorKind::Archive, &archive.name, reason));

        let fingerprint = match compute_fast_hash(&archive.path) {
            Ok(f) => f,
            Err(e) => return Ok(failed(e.to_string())),
        };

        if let Some(marker) = archive::read_marker(&s.work_dir, &archive.name) {
            if marker.fingerprint != fingerprint {
                let reason = changed_archive_reason(&s.work_dir, &archive.name);
                mark_archive_failed(store, &archive.name, &fingerprint, &reason)?;
                return Ok(failed(reason));
            }
            if !store.read(|st| st.archive_extracted(&archive.name)) {
                log::info!("Adopting existing extraction of {}", archive.name);
                store.update(|st| {
                    st.archives.insert(
                        archive.name.clone(),
                        ArchiveRecord {
                            status: ArchiveStatus::Extracted,
                            fingerprint: Some(marker.fingerprint.clone()),
                            files: marker.files,
                            error: None,
                            updated_at: Utc::now(),
                        },
                    );
                })?;
            }
            log::debug!("Skipping extracted archive {}", archive.name);
            return Ok(ExtractResult::AlreadyDone);
        }

        if s.dry_run {
            return Ok(match count_archive_entries(archive) {
                Ok(entries) => {
                    log::info!("[dry run] Would extract {} ({} entries)", archive.name, entries);
                    // a real run would retry an earlier failure
                    store.update(|st| st.archives.remove(&archive.name))?;
                    ExtractResult::Extracted
                }
                Err(e) => failed(e.to_string()),
            });
        }

        match archive::extract_archive(archive, &s.work_dir, &fingerprint) {
            Ok(marker) => {
                store.update(|st| {
                    st.archives.insert(
                        archive.name.clone(),
                        ArchiveRecord {
                            status: ArchiveStatus::Extracted,
                            fingerprint: Some(fingerprint.clone()),
                            files: marker.files,
                            error: None,
                            updated_at: Utc::now(),
                        },
                    );
                })?;
                Ok(ExtractResult::Extracted)
            }
            Err(e) => {
                let reason = match &e {
                    MigrateError::Archive { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                mark_archive_failed(store, &archive.name, &fingerprint, &reason)?;
                Ok(failed(reason))
            }
        }
    }

    // --- Catalog ---

    /// Files of every extracted archive. In a dry run, archives that were
    /// never extracted are read straight from the zip. Archives recorded as
    /// failed, or whose zip no longer matches its extraction, contribute nothing.
    fn collect_files(&self, store: &StateStore, ctx: &mut RunContext) -> Result<Vec<DiscoveredFile>> {
        let s = self.settings;
        let extract_ran = s.mode.includes(Phase::Extract);

        let mut names: BTreeSet<String> = store.read(|st| {
            st.archives
                .iter()
                .filter(|(_, r)| r.status == ArchiveStatus::Extracted)
                .map(|(name, _)| name.clone())
                .collect()
        });
        names.extend(archive::extracted_archives(&s.work_dir)?.into_iter().map(|m| m.archive));

        let mut sources: BTreeMap<String, ArchiveInfo> = BTreeMap::new();
        if s.source_dir.is_dir() {
            for a in archive::list_archives(&s.source_dir)? {
                names.insert(a.name.clone());
                sources.insert(a.name.clone(), a);
            }
        }

        let mut files = Vec::new();
        for name in &names {
            if let Some(record) = store.read(|st| st.archives.get(name).cloned()) {
                if record.status == ArchiveStatus::Failed {
                    log::warn!(
                        "Archive {} is marked failed ({}); its files are not part of this run",
                        name,
                        record.error.as_deref().unwrap_or("no reason recorded")
                    );
                    continue;
                }
            }
            if !extract_ran {
                if let Some(error) = self.stale_extraction(store, name, sources.get(name))? {
                    log::error!("Archive {} failed: {}", name, error.message);
                    ctx.errors.push(error);
                    ctx.failed_units += 1;
                    continue;
                }
            }

            let found = if archive::is_extracted(&s.work_dir, name) {
                discover_extracted(name, &archive::subtree_dir(&s.work_dir, name), &s.extensions)
            } else if let Some(info) = sources.get(name).filter(|_| s.dry_run && s.mode.includes(Phase::Extract)) {
                discover_in_archive(name, &info.path, &s.extensions)
            } else {
                log::warn!("Archive {} is not extracted; its files are not part of this run", name);
                continue;
            };

            match found {
                Ok(mut f) => files.append(&mut f),
                Err(e) => {
                    log::error!("Could not scan {}: {}", name, e);
                    ctx.errors.push(RecordedError::new(ErrorKind::Io, name, e.to_string()));
                    ctx.failed_units += 1;
                }
            }
        }
        log::info!("Discovered {} files in {} archives", files.len(), names.len());
        Ok(files)
    }

    /// Compare an extraction with the zip it came from. Only the extract
    /// phase makes this check otherwise.
    fn stale_extraction(&self, store: &StateStore, name: &str, source: Option<&ArchiveInfo>) -> Result<Option<RecordedError>> {
        let s = self.settings;
        let (Some(source), Some(marker)) = (source, archive::read_marker(&s.work_dir, name)) else {
            return Ok(None);
        };
        let fingerprint = match compute_fast_hash(&source.path) {
            Ok(f) => f,
            Err(e) => return Ok(Some(RecordedError::new(ErrorKind::Archive, name, e.to_string()))),
        };
        if marker.fingerprint == fingerprint {
            return Ok(None);
        }
        let reason = changed_archive_reason(&s.work_dir, name);
        mark_archive_failed(store, name, &fingerprint, &reason)?;
        Ok(Some(RecordedError::new(ErrorKind::Archive, name, reason)))
    }

    fn resolve_scope(&self, catalog: &Catalog) -> Vec<ItemScope> {
        let filter = &self.settings.album_filter;
        catalog
            .items
            .iter()
            .map(|item| {
                let albums = catalog.albums_of(item);
                ItemScope {
                    in_scope: filter.in_scope(&albums),
                    assignments: filter.assignments(&albums),
                }
            })
            .collect()
    }

    /// Unmatched items and unreadable sidecars are reported but do not fail the run.
    fn record_catalog_findings(&self, catalog: &Catalog, scope: &[ItemScope], ctx: &mut RunContext) {
        ctx.errors.extend(catalog.problems.iter().cloned());
        for (item, scope) in catalog.items.iter().zip(scope) {
            if !scope.in_scope || item.is_matched() {
                continue;
            }
            let error = if item.ambiguous_with.is_empty() {
                RecordedError::new(ErrorKind::Unmatched, &item.id, "no sidecar found")
            } else {
                RecordedError::new(
                    ErrorKind::AmbiguousMatch,
                    &item.id,
                    format!("ambiguous sidecars: {}", item.ambiguous_with.join(", ")),
                )
            };
            ctx.errors.push(error);
        }
    }

    // --- Metadata ---

    fn metadata_phase(&self, store: &StateStore, ctx: &mut RunContext, catalog: &Catalog, scope: &[ItemScope]) -> Result<()> {
        let s = self.settings;
        self.enter(store, Phase::Metadata)?;

        let mut summary = PhaseSummary::new(Phase::Metadata);
        summary.total = catalog.items.len();
        let snapshot = store.snapshot();

        let mut todo: Vec<usize> = Vec::new();
        for (idx, item) in catalog.items.iter().enumerate() {
            if snapshot.item_done(&item.id, Phase::Metadata) {
                summary.already_done += 1;
            } else if !scope[idx].in_scope || (s.skip_unmatched && !item.is_matched()) {
                summary.skipped += 1;
                if !s.dry_run {
                    store.record(|st| {
                        let record = st.item_mut(&item.id, ItemStatus::Skipped);
                        if record.completed.is_empty() {
                            record.status = ItemStatus::Skipped;
                            record.updated_at = Utc::now();
                        }
                    })?;
                }
            } else {
                todo.push(idx);
            }
        }

        let embedder = Embedder::new(self.runner, &s.tools.exiftool, &s.output_dir, s.tools.utc_offset);
        let progress = ProgressCounter::new("metadata", todo.len());
        let results = run_bounded(s.workers, &todo, &self.cancel, |&idx| {
            let item = &catalog.items[idx];
            let plan = embedder.plan(item, s.extensions.is_video(item.file.file_name()));
            let outcome = if s.dry_run {
                if plan.writes_tags() {
                    log::debug!("[dry run] Would embed {} tags into {}", item.id, plan.output.display());
                }
                Ok(if plan.writes_tags() { EmbedOutcome::Embedded } else { EmbedOutcome::Staged })
            } else {
                embedder.apply(item, &plan)
            };
            progress.tick();
            if s.dry_run {
                Ok(outcome)
            } else {
                self.record_embed(store, item, &scope[idx], &outcome).map(|_| outcome)
            }
        })?;

        for (idx, result) in todo.iter().zip(results) {
            match result {
                None => ctx.interrupted = true,
                Some(Err(e)) => return Err(e),
                Some(Ok(Ok(_))) => summary.processed += 1,
                Some(Ok(Err(e))) => {
                    let item = &catalog.items[*idx];
                    log::error!("Metadata failed for {}: {}", item.id, e);
                    summary.failed += 1;
                    ctx.errors.push(RecordedError::new(embed_error_kind(&e), &item.id, e.to_string()));
                }
            }
        }

        store.flush()?;
        self.leave(store, ctx, summary)
    }

    fn record_embed(&self, store: &StateStore, item: &MediaItem, scope: &ItemScope, outcome: &Result<EmbedOutcome>) -> Result<()> {
        store.record(|st| {
            let record = st.item_mut(&item.id, item.status);
            record.output = Some(item.output_rel.clone());
            record.albums = scope.assignments.clone();
            record.match_rule = item.match_rule;
            record.attempts += 1;
            record.updated_at = Utc::now();
            match outcome {
                Ok(EmbedOutcome::Embedded) => {
                    record.status = ItemStatus::Embedded;
                    record.completed.insert(Phase::Metadata);
                    record.error = None;
                }
                Ok(EmbedOutcome::Staged) => {
                    record.status = if item.is_matched() { ItemStatus::Embedded } else { ItemStatus::Unmatched };
                    record.completed.insert(Phase::Metadata);
                    record.error = None;
                }
                Err(e) => {
                    record.status = ItemStatus::Failed;
                    record.error = Some(RecordedError::new(embed_error_kind(e), &item.id, e.to_string()));
                }
            }
        })
    }

    // --- Import ---

    fn import_phase(&self, store: &StateStore, ctx: &mut RunContext, catalog: &Catalog, scope: &[ItemScope]) -> Result<()> {
        let s = self.settings;
        self.enter(store, Phase::Import)?;

        let mut summary = PhaseSummary::new(Phase::Import);
        summary.total = catalog.items.len();
        let snapshot = store.snapshot();
        let staged_this_run = s.dry_run && s.mode.includes(Phase::Metadata);

        let mut requests: Vec<ImportRequest> = Vec::new();
        for (idx, item) in catalog.items.iter().enumerate() {
            if snapshot.item_done(&item.id, Phase::Import) {
                summary.already_done += 1;
                continue;
            }
            let would_stage = staged_this_run && !(s.skip_unmatched && !item.is_matched());
            if !scope[idx].in_scope || !(snapshot.item_done(&item.id, Phase::Metadata) || would_stage) {
                summary.skipped += 1;
                continue;
            }
            requests.push(ImportRequest {
                item_id: item.id.clone(),
                path: output_path(&s.output_dir, item),
                albums: scope[idx].assignments.clone(),
            });
        }
        log::info!("{} items to import", requests.len());

        if s.dry_run {
            for request in &requests {
                log::debug!("[dry run] Would import {} into {:?}", request.path.display(), request.albums);
            }
            if s.import_strategy == ImportStrategy::Batch {
                let batches = plan_batches(&requests, s.import_batch_size);
                log::info!("[dry run] Would import {} items in {} batches", requests.len(), batches.len());
            }
            summary.processed = requests.len();
            return self.leave(store, ctx, summary);
        }

        write_manifest(
            &state_dir(&s.work_dir).join(MANIFEST_FILENAME),
            &ImportManifest {
                run_id: ctx.run_id.clone(),
                generated_at: Utc::now(),
                entries: requests.clone(),
            },
        )?;

        let driver = ImportDriver::new(
            self.runner,
            &s.tools.import_tool,
            s.tools.health_command.clone(),
            s.tools.restart_command.clone(),
        );
        match s.import_strategy {
            ImportStrategy::PerFile => self.import_each(store, ctx, &mut summary, &driver, &requests)?,
            ImportStrategy::Batch => self.import_batches(store, ctx, &mut summary, &driver, &requests)?,
        }

        store.flush()?;
        self.leave(store, ctx, summary)
    }

    fn import_each(
        &self,
        store: &StateStore,
        ctx: &mut RunContext,
        summary: &mut PhaseSummary,
        driver: &ImportDriver<'_>,
        requests: &[ImportRequest],
    ) -> Result<()> {
        let interval = self.settings.monitoring.health_check_interval.max(1);
        let progress = ProgressCounter::new("import", requests.len());

        for (n, request) in requests.iter().enumerate() {
            if self.cancel.is_cancelled() {
                ctx.interrupted = true;
                break;
            }
            if driver.has_health_check() && n % interval == 0 && !self.ensure_available(driver) {
                log::error!("Destination application unavailable, stopping import");
                ctx.interrupted = true;
                break;
            }
            if !self.staged_file_present(store, ctx, summary, request)? {
                progress.tick();
                continue;
            }

            let mut attempt = 0;
            let outcome = loop {
                match driver.import(request) {
                    ImportOutcome::AppUnavailable(reason) => {
                        attempt += 1;
                        match self.recover(driver, &reason, attempt) {
                            Recovery::Retry => continue,
                            Recovery::Abort => break Err(reason),
                        }
                    }
                    other => break Ok(other),
                }
            };

            match outcome {
                Err(reason) => {
                    self.record_unavailable(store, ctx, std::slice::from_ref(request), reason)?;
                    break;
                }
                Ok(outcome) => self.apply_import_outcome(store, ctx, summary, request, outcome)?,
            }
            progress.tick();
        }
        Ok(())
    }

    /// Same-album groups go to the tool together; the health check runs
    /// before every batch.
    fn import_batches(
        &self,
        store: &StateStore,
        ctx: &mut RunContext,
        summary: &mut PhaseSummary,
        driver: &ImportDriver<'_>,
        requests: &[ImportRequest],
    ) -> Result<()> {
        let s = self.settings;
        let report_path = state_dir(&s.work_dir).join(BATCH_REPORT_FILENAME);
        let batches = plan_batches(requests, s.import_batch_size);
        log::info!("Importing {} items in {} batches", requests.len(), batches.len());
        let progress = ProgressCounter::new("import", requests.len());

        for planned in batches {
            if self.cancel.is_cancelled() {
                ctx.interrupted = true;
                break;
            }
            if driver.has_health_check() && !self.ensure_available(driver) {
                log::error!("Destination application unavailable, stopping import");
                ctx.interrupted = true;
                break;
            }

            let mut present = Vec::new();
            for request in planned.requests {
                if self.staged_file_present(store, ctx, summary, &request)? {
                    present.push(request);
                } else {
                    progress.tick();
                }
            }
            if present.is_empty() {
                continue;
            }
            let batch = ImportBatch {
                albums: planned.albums,
                requests: present,
            };

            let mut attempt = 0;
            let outcomes = loop {
                match driver.import_batch(&batch, &report_path) {
                    BatchOutcome::AppUnavailable(reason) => {
                        attempt += 1;
                        match self.recover(driver, &reason, attempt) {
                            Recovery::Retry => continue,
                            Recovery::Abort => break Err(reason),
                        }
                    }
                    BatchOutcome::Done(outcomes) => break Ok(outcomes),
                }
            };

            match outcomes {
                Err(reason) => {
                    self.record_unavailable(store, ctx, &batch.requests, reason)?;
                    break;
                }
                Ok(outcomes) => {
                    for (request, outcome) in batch.requests.iter().zip(outcomes) {
                        self.apply_import_outcome(store, ctx, summary, request, outcome)?;
                        progress.tick();
                    }
                }
            }
        }
        Ok(())
    }

    /// Records a failure and returns false when the staged file is gone.
    fn staged_file_present(
        &self,
        store: &StateStore,
        ctx: &mut RunContext,
        summary: &mut PhaseSummary,
        request: &ImportRequest,
    ) -> Result<bool> {
        if request.path.exists() {
            return Ok(true);
        }
        let error = RecordedError::new(
            ErrorKind::Io,
            &request.item_id,
            format!("staged file missing: {}", request.path.display()),
        );
        self.record_import_failure(store, request, &error)?;
        ctx.errors.push(error);
        summary.failed += 1;
        Ok(false)
    }

    /// The staged file is only deleted once the item is in the library.
    fn apply_import_outcome(
        &self,
        store: &StateStore,
        ctx: &mut RunContext,
        summary: &mut PhaseSummary,
        request: &ImportRequest,
        outcome: ImportOutcome,
    ) -> Result<()> {
        if !outcome.is_complete() {
            let message = match outcome {
                ImportOutcome::Failed(m) | ImportOutcome::AppUnavailable(m) => m,
                _ => String::new(),
            };
            log::error!("Import failed for {}: {}", request.item_id, message);
            let error = RecordedError::new(ErrorKind::Import, &request.item_id, message);
            self.record_import_failure(store, request, &error)?;
            ctx.errors.push(error);
            summary.failed += 1;
            return Ok(());
        }

        store.update(|st| {
            let record = st.item_mut(&request.item_id, ItemStatus::Imported);
            record.status = ItemStatus::Imported;
            record.completed.insert(Phase::Import);
            record.albums = request.albums.clone();
            record.error = None;
            record.attempts += 1;
            record.updated_at = Utc::now();
        })?;
        summary.processed += 1;
        if outcome == ImportOutcome::Duplicate {
            summary.duplicates += 1;
        }
        if self.settings.delete_after_import {
            if let Err(e) = std::fs::remove_file(&request.path) {
                log::warn!("Could not delete {}: {}", request.path.display(), e);
            }
        }
        Ok(())
    }

    /// The destination stayed unreachable: note it on the affected items and
    /// stop the phase.
    fn record_unavailable(&self, store: &StateStore, ctx: &mut RunContext, requests: &[ImportRequest], reason: String) -> Result<()> {
        store.update(|st| {
            for request in requests {
                if let Some(record) = st.items.get_mut(&request.item_id) {
                    record.error = Some(RecordedError::new(ErrorKind::AppUnavailable, &request.item_id, reason.clone()));
                    record.updated_at = Utc::now();
                }
            }
        })?;
        if let Some(first) = requests.first() {
            ctx.errors.push(RecordedError::new(ErrorKind::AppUnavailable, &first.item_id, reason));
        }
        ctx.interrupted = true;
        Ok(())
    }

    fn record_import_failure(&self, store: &StateStore, request: &ImportRequest, error: &RecordedError) -> Result<()> {
        store.update(|st| {
            let record = st.item_mut(&request.item_id, ItemStatus::Failed);
            record.status = ItemStatus::Failed;
            record.error = Some(error.clone());
            record.attempts += 1;
            record.updated_at = Utc::now();
        })
    }

    /// Check until the destination answers or the policy gives up.
    fn ensure_available(&self, driver: &ImportDriver<'_>) -> bool {
        let mut attempt = 0;
        while !driver.is_available() {
            attempt += 1;
            match self.recover(driver, "health check failed", attempt) {
                Recovery::Retry => continue,
                Recovery::Abort => return false,
            }
        }
        true
    }

    fn recover(&self, driver: &ImportDriver<'_>, reason: &str, attempt: u32) -> Recovery {
        let monitoring = &self.settings.monitoring;
        log::warn!("Destination application unavailable ({}), attempt {}", reason, attempt);
        if self.cancel.is_cancelled() {
            return Recovery::Abort;
        }

        match monitoring.on_unavailable {
            UnavailablePolicy::Abort => Recovery::Abort,
            UnavailablePolicy::Retry => {
                if attempt > monitoring.max_retries {
                    log::error!("Giving up after {} retries", monitoring.max_retries);
                    return Recovery::Abort;
                }
                driver.restart();
                std::thread::sleep(Duration::from_secs(monitoring.retry_delay_secs));
                Recovery::Retry
            }
            UnavailablePolicy::Prompt => match self.prompt.app_unavailable(reason) {
                OperatorChoice::Continue => Recovery::Retry,
                OperatorChoice::Restart => {
                    driver.restart();
                    std::thread::sleep(Duration::from_secs(monitoring.retry_delay_secs));
                    Recovery::Retry
                }
                OperatorChoice::Abort => Recovery::Abort,
            },
        }
    }

    // --- Report ---

    fn finish(&self, store: &StateStore, ctx: RunContext, catalog: Option<&Catalog>) -> Result<RunSummary> {
        let s = self.settings;
        let outcome = if ctx.interrupted {
            RunOutcome::Interrupted
        } else if ctx.failed_units > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Success
        };
        let finished_at = Utc::now();

        store.update(|st| {
            if !ctx.interrupted {
                st.stage = Stage::Done;
            }
            if let Some(run) = st.last_run.as_mut() {
                run.finished_at = Some(finished_at);
                run.outcome = Some(outcome.as_str().to_string());
            }
        })?;
        let snapshot = store.snapshot();

        let mut report = RunReport {
            run_id: ctx.run_id,
            mode: s.mode,
            dry_run: s.dry_run,
            started_at: ctx.started_at,
            finished_at,
            outcome,
            phases: ctx.phases,
            items_total: 0,
            matched: 0,
            unmatched: 0,
            match_rules: BTreeMap::new(),
            error_counts: BTreeMap::new(),
            errors: ctx.errors,
            orphan_sidecars: Vec::new(),
            items: Vec::new(),
            albums: Vec::new(),
        };
        report.count_errors();

        if let Some(catalog) = catalog {
            fill_catalog_rows(&mut report, catalog, &snapshot, &self.resolve_scope(catalog));
        }

        let report_path = if s.dry_run {
            None
        } else {
            Some(report::write_report(&state_dir(&s.work_dir), &report)?)
        };
        log::info!("Run {} finished: {}", report.run_id, outcome.as_str());

        Ok(RunSummary {
            outcome,
            report,
            report_path,
        })
    }
}

fn fill_catalog_rows(report: &mut RunReport, catalog: &Catalog, snapshot: &PipelineState, scope: &[ItemScope]) {
    report.items_total = catalog.items.len();
    report.matched = catalog.matched_count();
    report.unmatched = catalog.unmatched_count();
    report.orphan_sidecars = catalog.orphan_sidecars.clone();

    for item in &catalog.items {
        if let Some(rule) = item.match_rule {
            *report.match_rules.entry(rule).or_insert(0) += 1;
        }
    }

    report.items = catalog
        .items
        .iter()
        .zip(scope)
        .map(|(item, scope)| {
            let record = snapshot.items.get(&item.id);
            ItemRow {
                id: item.id.clone(),
                output: item.output_rel.clone(),
                status: record.map(|r| r.status).unwrap_or(item.status),
                albums: scope.assignments.clone(),
                match_rule: item.match_rule,
                error: record.and_then(|r| r.error.as_ref()).map(|e| e.message.clone()),
            }
        })
        .collect();

    report.albums = catalog
        .albums
        .iter()
        .map(|a| AlbumRow {
            name: a.name.clone(),
            kind: a.kind,
            members: a.members.len(),
        })
        .collect();
}

fn changed_archive_reason(work_dir: &Path, name: &str) -> String {
    format!(
        "archive changed since it was extracted; delete {} to extract it again",
        archive::subtree_dir(work_dir, name).display()
    )
}

fn mark_archive_failed(store: &StateStore, name: &str, fingerprint: &str, reason: &str) -> Result<()> {
    store.update(|st| {
        st.archives.insert(
            name.to_string(),
            ArchiveRecord {
                status: ArchiveStatus::Failed,
                fingerprint: Some(fingerprint.to_string()),
                files: 0,
                error: Some(reason.to_string()),
                updated_at: Utc::now(),
            },
        );
    })
}

fn embed_error_kind(error: &MigrateError) -> ErrorKind {
    match error {
        MigrateError::Embed(_) => ErrorKind::Embed,
        _ => ErrorKind::Io,
    }
}

/// Open an archive's central directory without extracting it.
fn count_archive_entries(archive: &ArchiveInfo) -> Result<usize> {
    let file = std::fs::File::open(&archive.path)?;
    Ok(zip::ZipArchive::new(file)?.len())
}

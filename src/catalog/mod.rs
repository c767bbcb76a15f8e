// Catalog: media items, their sidecars and albums
//
// Builds the per-run view of the working tree. Files from all archives are
// grouped by their directory below the album root, matched against sidecars
// of that directory, collapsed into one item per physical photo, and placed
// into albums.

pub mod albums;
pub mod discover;
pub mod matching;
pub mod sidecar;


use std::collections::{BTreeMap, HashMap, HashSet};
use serde::{Deserialize, Serialize};
use crate::constants::DEFAULT_ALBUM_ROOTS;
use crate::error::{ErrorKind, RecordedError};
use albums::{AlbumIndex, AlbumReference};
use discover::{DiscoveredFile, FileClass, MediaExtensions};
use matching::{match_directory, Candidate, CandidateSet, MatchPolicy, MatchRule, SidecarMatch};
use sidecar::{parse_sidecar, SidecarContent, SidecarRecord};

/// Processing status of a media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Matched,
    Unmatched,
    Embedded,
    Imported,
    Failed,
    Skipped,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Matched => "matched",
            ItemStatus::Unmatched => "unmatched",
            ItemStatus::Embedded => "embedded",
            ItemStatus::Imported => "imported",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaItem {
    /// Unit id of the canonical copy
    pub id: String,
    pub file: DiscoveredFile,
    /// Path below the album root, '/'-separated
    pub logical_path: String,
    /// File stem of the media file
    pub base_name: String,
    pub sidecar: Option<SidecarRecord>,
    pub match_rule: Option<MatchRule>,
    /// Sidecar units that tied when matching was ambiguous
    pub ambiguous_with: Vec<String>,
    /// Album keys, first-seen order
    pub albums: Vec<String>,
    /// Unit ids of identical copies folded into this item
    pub copies: Vec<String>,
    /// Destination path below output_dir, '/'-separated
    pub output_rel: String,
    pub status: ItemStatus,
}

impl MediaItem {
    pub fn is_matched(&self) -> bool {
        self.sidecar.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct CatalogOptions {
    pub album_roots: Vec<String>,
    pub extensions: MediaExtensions,
    pub matching: MatchPolicy,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            album_roots: DEFAULT_ALBUM_ROOTS.iter().map(|s| s.to_string()).collect(),
            extensions: MediaExtensions::default(),
            matching: MatchPolicy::default(),
        }
    }
}

impl CatalogOptions {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self {
            album_roots: settings.album_roots.clone(),
            extensions: settings.extensions.clone(),
            matching: settings.matching.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    /// Sorted by id
    pub items: Vec<MediaItem>,
    pub albums: AlbumIndex,
    /// Sidecar units no media file claimed
    pub orphan_sidecars: Vec<String>,
    /// Sidecars that could not be parsed
    pub problems: Vec<RecordedError>,
}

impl Catalog {
    pub fn item(&self, id: &str) -> Option<&MediaItem> {
        self.items
            .binary_search_by(|i| i.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.items[idx])
    }

    pub fn albums_of(&self, item: &MediaItem) -> Vec<&AlbumReference> {
        item.albums.iter().filter_map(|k| self.albums.get(k)).collect()
    }

    pub fn matched_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_matched()).count()
    }

    pub fn unmatched_count(&self) -> usize {
        self.items.len() - self.matched_count()
    }
}

/// Where a file sits relative to the Takeout album root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DirKey {
    in_album_root: bool,
    dir: String,
}

#[derive(Default)]
struct DirGroup {
    media: Vec<usize>,
    sidecars: Vec<SidecarRecord>,
    album_title: Option<String>,
}

struct Draft {
    item: MediaItem,
    dir_album: Option<String>,
    copy_albums: Vec<String>,
}

/// Build the catalog from discovered files of every archive.
pub fn build_catalog(files: Vec<DiscoveredFile>, options: &CatalogOptions) -> Catalog {
    let mut files = files;
    files.sort_by_key(|f| f.unit_id());

    let mut problems = Vec::new();
    let mut groups: BTreeMap<DirKey, DirGroup> = BTreeMap::new();
    let mut located: Vec<(DirKey, String)> = Vec::with_capacity(files.len());

    for (idx, file) in files.iter().enumerate() {
        let (in_album_root, logical) = locate(&file.rel_path, &options.album_roots);
        let dir = logical.rsplit_once('/').map(|(d, _)| d.to_string()).unwrap_or_default();
        let key = DirKey { in_album_root, dir };
        let group = groups.entry(key.clone()).or_default();
        located.push((key, logical));

        match file.class {
            FileClass::Media => group.media.push(idx),
            FileClass::Sidecar | FileClass::AlbumMetadata => {
                let parsed = file.read_bytes().and_then(|bytes| {
                    parse_sidecar(&file.unit_id(), file.file_name(), &bytes, file.class == FileClass::AlbumMetadata)
                });
                match parsed {
                    Ok(SidecarContent::Item(record)) => group.sidecars.push(record),
                    Ok(SidecarContent::Album { title }) => {
                        if group.album_title.is_none() {
                            group.album_title = title;
                        }
                    }
                    Err(e) => {
                        log::warn!("Unreadable sidecar {}: {}", file.unit_id(), e);
                        problems.push(RecordedError::new(ErrorKind::SidecarParse, file.unit_id(), e.to_string()));
                    }
                }
            }
            FileClass::Ignored => {}
        }
    }

    let mut claimed: HashSet<String> = HashSet::new();
    let mut drafts: Vec<Draft> = Vec::new();

    for (key, group) in &groups {
        let joined: Vec<String> = group.sidecars.iter().map(|s| s.key.joined()).collect();
        let candidates = CandidateSet::new(
            group
                .sidecars
                .iter()
                .zip(&joined)
                .enumerate()
                .map(|(index, (record, key))| Candidate {
                    index,
                    key: key.as_str(),
                    title: record.title.as_deref(),
                })
                .collect(),
        );
        let names: Vec<&str> = group.media.iter().map(|&i| files[i].file_name()).collect();
        let results = match_directory(&names, &candidates, &options.matching);

        let dir_album = if key.in_album_root && !key.dir.is_empty() {
            group
                .album_title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .or_else(|| key.dir.rsplit('/').next().map(str::to_string))
        } else {
            None
        };

        for (&file_idx, result) in group.media.iter().zip(results) {
            let file = &files[file_idx];
            let (sidecar, match_rule, ambiguous_with) = match result {
                SidecarMatch::Matched { sidecar, rule } => {
                    let record = group.sidecars[sidecar].clone();
                    claimed.insert(record.unit.clone());
                    (Some(record), Some(rule), Vec::new())
                }
                SidecarMatch::Ambiguous { candidates, rule } => {
                    log::debug!("Ambiguous sidecar match ({:?}) for {}", rule, file.unit_id());
                    let units = candidates.iter().map(|&c| group.sidecars[c].unit.clone()).collect();
                    (None, None, units)
                }
                SidecarMatch::NoCandidate => (None, None, Vec::new()),
            };

            let base_name = match file.file_name().rfind('.') {
                Some(dot) if dot > 0 => file.file_name()[..dot].to_string(),
                _ => file.file_name().to_string(),
            };
            let status = if sidecar.is_some() { ItemStatus::Matched } else { ItemStatus::Unmatched };
            let logical_path = located[file_idx].1.clone();
            let output_rel = if key.in_album_root { logical_path.clone() } else { file.rel_path.clone() };

            drafts.push(Draft {
                item: MediaItem {
                    id: file.unit_id(),
                    file: file.clone(),
                    logical_path,
                    base_name,
                    sidecar,
                    match_rule,
                    ambiguous_with,
                    albums: Vec::new(),
                    copies: Vec::new(),
                    output_rel,
                    status,
                },
                dir_album: dir_album.clone(),
                copy_albums: Vec::new(),
            });
        }
    }

    let mut orphan_sidecars: Vec<String> = groups
        .values()
        .flat_map(|g| g.sidecars.iter())
        .filter(|s| !claimed.contains(&s.unit))
        .map(|s| s.unit.clone())
        .collect();
    orphan_sidecars.sort();

    drafts.sort_by(|a, b| a.item.id.cmp(&b.item.id));
    let mut drafts = collapse_copies(drafts);

    let mut albums = AlbumIndex::new();
    for draft in &mut drafts {
        let item = &mut draft.item;
        let mut names: Vec<String> = Vec::new();
        names.extend(draft.dir_album.iter().cloned());
        names.extend(draft.copy_albums.iter().cloned());
        if let Some(record) = &item.sidecar {
            names.extend(record.albums.iter().cloned());
        }
        for name in names {
            if let Some(key) = albums.add_member(&name, &item.id) {
                if !item.albums.contains(&key) {
                    item.albums.push(key);
                }
            }
        }
    }

    let mut items: Vec<MediaItem> = drafts.into_iter().map(|d| d.item).collect();
    assign_output_paths(&mut items);

    log::info!(
        "Catalogued {} items ({} matched), {} albums, {} orphan sidecars",
        items.len(),
        items.iter().filter(|i| i.is_matched()).count(),
        albums.len(),
        orphan_sidecars.len()
    );

    Catalog {
        items,
        albums,
        orphan_sidecars,
        problems,
    }
}

/// Split a path into (inside album root, path below the root).
fn locate(rel_path: &str, album_roots: &[String]) -> (bool, String) {
    for root in album_roots {
        let root = root.trim_matches('/');
        if root.is_empty() {
            continue;
        }
        if let Some(rest) = rel_path.strip_prefix(root).and_then(|r| r.strip_prefix('/')) {
            return (true, rest.to_string());
        }
    }
    (false, rel_path.to_string())
}

/// Fold byte-identical copies (same name, size and fast hash) into the first
/// one in id order. Album folders and a missing sidecar are inherited.
fn collapse_copies(drafts: Vec<Draft>) -> Vec<Draft> {
    let mut by_name_size: HashMap<(String, u64), Vec<usize>> = HashMap::new();
    for (idx, d) in drafts.iter().enumerate() {
        by_name_size
            .entry((d.item.file.file_name().to_string(), d.item.file.size))
            .or_default()
            .push(idx);
    }

    // index of the canonical draft for every folded one
    let mut canonical_of: HashMap<usize, usize> = HashMap::new();
    for indexes in by_name_size.values().filter(|v| v.len() > 1) {
        let mut by_hash: HashMap<String, usize> = HashMap::new();
        for &idx in indexes {
            let hash = match drafts[idx].item.file.fast_hash() {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("Could not hash {}: {}", drafts[idx].item.id, e);
                    continue;
                }
            };
            match by_hash.get(&hash) {
                Some(&first) => {
                    canonical_of.insert(idx, first);
                }
                None => {
                    by_hash.insert(hash, idx);
                }
            }
        }
    }

    if canonical_of.is_empty() {
        return drafts;
    }

    let mut slots: Vec<Option<Draft>> = drafts.into_iter().map(Some).collect();
    let mut folded: Vec<usize> = canonical_of.keys().copied().collect();
    folded.sort_unstable();

    for idx in folded {
        let Some(copy) = slots[idx].take() else {
            continue;
        };
        let Some(target) = slots[canonical_of[&idx]].as_mut() else {
            continue;
        };
        log::debug!("Folding copy {} into {}", copy.item.id, target.item.id);
        target.item.copies.push(copy.item.id);
        target.copy_albums.extend(copy.dir_album);
        if target.item.sidecar.is_none() && copy.item.sidecar.is_some() {
            target.item.sidecar = copy.item.sidecar;
            target.item.match_rule = copy.item.match_rule;
            target.item.ambiguous_with.clear();
            target.item.status = ItemStatus::Matched;
        } else if let Some(record) = copy.item.sidecar {
            // albums listed only in the copy's sidecar still count
            target.copy_albums.extend(record.albums);
        }
    }

    slots.into_iter().flatten().collect()
}

/// Give every item a unique output path; later collisions get `_1`, `_2`, ...
fn assign_output_paths(items: &mut [MediaItem]) {
    let mut taken: HashSet<String> = HashSet::new();
    for item in items.iter_mut() {
        let wanted = item.output_rel.clone();
        let mut candidate = wanted.clone();
        let mut n = 1;
        // case-insensitive: destination volumes usually are
        while !taken.insert(candidate.to_lowercase()) {
            candidate = with_suffix(&wanted, n);
            n += 1;
        }
        item.output_rel = candidate;
    }
}

fn with_suffix(rel: &str, n: usize) -> String {
    let (dir, name) = match rel.rsplit_once('/') {
        Some((d, f)) => (Some(d), f),
        None => (None, rel),
    };
    let name = match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &name[..dot], n, &name[dot..]),
        _ => format!("{}_{}", name, n),
    };
    match dir {
        Some(d) => format!("{}/{}", d, name),
        None => name,
    }
}

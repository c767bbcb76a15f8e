// Album resolution
//
// Membership comes from two overlapping sources: the directory an item sits in
// below the album root, and album names listed in its sidecar. Both go through
// the same normalization so one name maps to exactly one AlbumReference.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use crate::constants::AUTO_ALBUM_PATTERN;

static AUTO_ALBUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(AUTO_ALBUM_PATTERN).expect("valid auto album pattern"));
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static DASHES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-+").expect("valid regex"));
static SPACED_DASH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*-\s*").expect("valid regex"));

const REPLACEMENTS: [(char, &str); 10] = [
    (',', " -"),
    ('/', "-"),
    ('\\', "-"),
    (':', " -"),
    ('"', "'"),
    ('<', ""),
    ('>', ""),
    ('|', "-"),
    ('?', ""),
    ('*', ""),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlbumKind {
    /// Created by the user
    User,
    /// Generated by the export ("Photos from 2023")
    Auto { year: i32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumReference {
    /// Canonical key (case and whitespace folded)
    pub key: String,
    /// Display name used for the destination album
    pub name: String,
    pub kind: AlbumKind,
    /// Item ids in discovery order
    pub members: Vec<String>,
    #[serde(skip)]
    member_set: HashSet<String>,
}

impl AlbumReference {
    pub fn is_auto(&self) -> bool {
        matches!(self.kind, AlbumKind::Auto { .. })
    }
}

/// Make an album name safe for the destination application.
pub fn sanitize_album_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match REPLACEMENTS.iter().find(|(c, _)| *c == ch) {
            Some((_, replacement)) => out.push_str(replacement),
            None => out.push(ch),
        }
    }
    let out = WHITESPACE_RE.replace_all(&out, " ");
    let out = DASHES_RE.replace_all(&out, "-");
    let out = SPACED_DASH_RE.replace_all(&out, " - ");
    out.trim().trim_matches('-').trim().to_string()
}

/// Canonical key: sanitized, lower-cased, single-spaced.
pub fn album_key(name: &str) -> String {
    sanitize_album_name(name).to_lowercase()
}

pub fn album_kind(name: &str) -> AlbumKind {
    match AUTO_ALBUM_RE.captures(name.trim()) {
        Some(caps) => match caps.get(2).and_then(|y| y.as_str().parse().ok()) {
            Some(year) => AlbumKind::Auto { year },
            None => AlbumKind::User,
        },
        None => AlbumKind::User,
    }
}

/// All albums of a run, one instance per canonical key.
#[derive(Debug, Clone, Default)]
pub struct AlbumIndex {
    albums: Vec<AlbumReference>,
    by_key: HashMap<String, usize>,
}

impl AlbumIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the album for a raw name. None when nothing is left
    /// after sanitizing.
    pub fn resolve(&mut self, raw_name: &str) -> Option<String> {
        let name = sanitize_album_name(raw_name);
        if name.is_empty() {
            return None;
        }
        let key = name.to_lowercase();
        if !self.by_key.contains_key(&key) {
            self.by_key.insert(key.clone(), self.albums.len());
            self.albums.push(AlbumReference {
                key: key.clone(),
                kind: album_kind(&name),
                name,
                members: Vec::new(),
                member_set: HashSet::new(),
            });
        }
        Some(key)
    }

    /// Add an item to an album, creating the album on first use.
    pub fn add_member(&mut self, raw_name: &str, item_id: &str) -> Option<String> {
        let key = self.resolve(raw_name)?;
        let album = &mut self.albums[self.by_key[&key]];
        if album.member_set.insert(item_id.to_string()) {
            album.members.push(item_id.to_string());
        }
        Some(key)
    }

    pub fn get(&self, key: &str) -> Option<&AlbumReference> {
        self.by_key.get(key).map(|&i| &self.albums[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlbumReference> {
        self.albums.iter()
    }

    pub fn len(&self) -> usize {
        self.albums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.albums.is_empty()
    }
}

/// Include/exclude view over album membership, used to scope test runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlbumFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    include_auto: bool,
}

impl AlbumFilter {
    pub fn new(include: &[String], exclude: &[String], include_auto: bool) -> Self {
        let keys = |names: &[String]| -> Vec<String> {
            names.iter().map(|n| album_key(n)).filter(|k| !k.is_empty()).collect()
        };
        Self {
            include: keys(include),
            exclude: keys(exclude),
            include_auto,
        }
    }

    /// Whether an include or exclude list is set.
    pub fn is_scoped(&self) -> bool {
        !self.include.is_empty() || !self.exclude.is_empty()
    }

    /// Whether an item with these albums takes part in the run.
    pub fn in_scope(&self, albums: &[&AlbumReference]) -> bool {
        if !self.include.is_empty() && !albums.iter().any(|a| self.include.contains(&a.key)) {
            return false;
        }
        if !albums.is_empty() && albums.iter().all(|a| self.exclude.contains(&a.key)) {
            return false;
        }
        true
    }

    /// Album names the item is imported into.
    pub fn assignments(&self, albums: &[&AlbumReference]) -> Vec<String> {
        albums
            .iter()
            .filter(|a| !self.exclude.contains(&a.key))
            .filter(|a| !a.is_auto() || self.include_auto || self.include.contains(&a.key))
            .map(|a| a.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_album_name() {
        assert_eq!(sanitize_album_name("Urlaub: Italien"), "Urlaub - Italien");
        assert_eq!(sanitize_album_name("Berlin, Hamburg"), "Berlin - Hamburg");
        assert_eq!(sanitize_album_name("A/B\\C"), "A - B - C");
        assert_eq!(sanitize_album_name("What? *Really*"), "What Really");
        assert_eq!(sanitize_album_name("  Say \"cheese\"  "), "Say 'cheese'");
        assert_eq!(sanitize_album_name("a --- b"), "a - b");
        assert_eq!(sanitize_album_name("???"), "");
    }

    #[test]
    fn test_album_key_folds_case_and_whitespace() {
        assert_eq!(album_key("Summer  Trip"), album_key("summer trip"));
        assert_eq!(album_key(" SUMMER\tTRIP "), "summer trip");
    }

    #[test]
    fn test_auto_album_detection() {
        assert_eq!(album_kind("Photos from 2023"), AlbumKind::Auto { year: 2023 });
        assert_eq!(album_kind("Fotos von 2019"), AlbumKind::Auto { year: 2019 });
        assert_eq!(album_kind("photos FROM 2001"), AlbumKind::Auto { year: 2001 });
        assert_eq!(album_kind("Photos from Paris"), AlbumKind::User);
        assert_eq!(album_kind("Best photos from 2023"), AlbumKind::User);
    }

    #[test]
    fn test_index_merges_variants() {
        let mut index = AlbumIndex::new();
        let a = index.add_member("Summer Trip", "z1/a.jpg").unwrap();
        let b = index.add_member("summer  trip", "z2/b.jpg").unwrap();
        let c = index.add_member("SUMMER TRIP", "z1/a.jpg").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(index.len(), 1);

        let album = index.get(&a).unwrap();
        assert_eq!(album.name, "Summer Trip");
        assert_eq!(album.members, vec!["z1/a.jpg", "z2/b.jpg"]);
        assert!(index.add_member("***", "z1/a.jpg").is_none());
    }

    fn albums(index: &AlbumIndex, keys: &[&str]) -> Vec<AlbumReference> {
        keys.iter().map(|k| index.get(k).unwrap().clone()).collect()
    }

    #[test]
    fn test_filter_scope_and_assignments() {
        let mut index = AlbumIndex::new();
        index.add_member("Trip", "1");
        index.add_member("Family", "1");
        index.add_member("Photos from 2023", "1");
        index.add_member("Work", "2");

        let item1 = albums(&index, &["trip", "family", "photos from 2023"]);
        let item1: Vec<&AlbumReference> = item1.iter().collect();
        let item2 = albums(&index, &["work"]);
        let item2: Vec<&AlbumReference> = item2.iter().collect();

        let all = AlbumFilter::default();
        assert!(!all.is_scoped());
        assert!(all.in_scope(&item1));
        assert!(all.in_scope(&[]));
        assert_eq!(all.assignments(&item1), vec!["Trip", "Family"]);

        let with_auto = AlbumFilter::new(&[], &[], true);
        assert_eq!(with_auto.assignments(&item1).len(), 3);

        let only_trip = AlbumFilter::new(&["trip".to_string()], &[], false);
        assert!(only_trip.is_scoped());
        assert!(only_trip.in_scope(&item1));
        assert!(!only_trip.in_scope(&item2));
        assert!(!only_trip.in_scope(&[]));
        assert_eq!(only_trip.assignments(&item1), vec!["Trip", "Family"]);

        let no_work = AlbumFilter::new(&[], &["WORK".to_string(), "Family".to_string()], false);
        assert!(!no_work.in_scope(&item2));
        assert!(no_work.in_scope(&item1));
        assert_eq!(no_work.assignments(&item1), vec!["Trip"]);
    }
}

// Sidecar matching
//
// Takeout truncates, suffixes and renumbers file names, so a media file is
// matched to its sidecar through ordered layers:
//   1. exact        <name>.json / <stem>.json / Google's <stem>.<ext>(n).json
//   2. suffix       same, after stripping "-edited" markers and "(n)" counters
//   3. truncated    recorded title, cut to the media stem length, equals the stem
//   4. fuzzy        unique longest common prefix above a threshold
// Each layer is a pure function over a candidate set that returns a match, a
// definitive ambiguity, or passes through.

use std::collections::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use crate::constants::{DEFAULT_EDITED_SUFFIXES, DEFAULT_FUZZY_MIN_PREFIX, DEFAULT_TRUNCATED_MIN_LEN};
use super::sidecar::split_counter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    Exact,
    SuffixStripped,
    Truncated,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPolicy {
    /// The fuzzy layer needs a shared prefix (characters) longer than this
    pub fuzzy_min_prefix: usize,
    /// Media stems shorter than this are never treated as truncated
    pub truncated_min_len: usize,
    /// Markers the export appends to edited copies
    pub edited_suffixes: Vec<String>,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            fuzzy_min_prefix: DEFAULT_FUZZY_MIN_PREFIX,
            truncated_min_len: DEFAULT_TRUNCATED_MIN_LEN,
            edited_suffixes: DEFAULT_EDITED_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A sidecar as the matcher sees it.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    /// Caller-side identifier, returned in results
    pub index: usize,
    /// Joined sidecar key (`IMG.jpg(1)`)
    pub key: &'a str,
    /// Original file name recorded in the sidecar
    pub title: Option<&'a str>,
}

/// Candidates of one directory, indexed by key.
#[derive(Debug, Clone)]
pub struct CandidateSet<'a> {
    candidates: Vec<Candidate<'a>>,
    by_key: HashMap<&'a str, Vec<usize>>,
}

impl<'a> CandidateSet<'a> {
    pub fn new(candidates: Vec<Candidate<'a>>) -> Self {
        let mut by_key: HashMap<&'a str, Vec<usize>> = HashMap::new();
        for c in &candidates {
            by_key.entry(c.key).or_default().push(c.index);
        }
        Self { candidates, by_key }
    }

    /// Copy of this set without the given candidate indexes.
    pub fn without(&self, claimed: &HashSet<usize>) -> CandidateSet<'a> {
        CandidateSet::new(
            self.candidates
                .iter()
                .filter(|c| !claimed.contains(&c.index))
                .copied()
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate<'a>> {
        self.candidates.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    fn lookup(&self, key: &str) -> &[usize] {
        self.by_key.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Outcome of a single layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerResult {
    Matched(usize),
    Ambiguous(Vec<usize>),
    NoMatch,
}

impl LayerResult {
    fn from_hits(mut hits: Vec<usize>) -> Self {
        match hits.len() {
            0 => LayerResult::NoMatch,
            1 => LayerResult::Matched(hits[0]),
            _ => {
                hits.sort_unstable();
                LayerResult::Ambiguous(hits)
            }
        }
    }
}

/// Final outcome for one media file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidecarMatch {
    Matched { sidecar: usize, rule: MatchRule },
    Ambiguous { candidates: Vec<usize>, rule: MatchRule },
    NoCandidate,
}

struct MediaName<'a> {
    stem: &'a str,
    ext: Option<&'a str>,
}

fn split_name(name: &str) -> MediaName<'_> {
    match name.rfind('.') {
        Some(dot) if dot > 0 => MediaName {
            stem: &name[..dot],
            ext: Some(&name[dot + 1..]),
        },
        _ => MediaName { stem: name, ext: None },
    }
}

/// Sidecar keys that belong to a media stem without any stripping.
fn exact_keys(stem: &str, ext: Option<&str>) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(ext) = ext {
        keys.push(format!("{}.{}", stem, ext));
    }
    keys.push(stem.to_string());
    if let (Some(ext), (base, Some(counter))) = (ext, split_counter(stem)) {
        keys.push(format!("{}.{}{}", base, ext, counter));
    }
    dedupe(keys)
}

fn keys_layer(keys: &[String], candidates: &CandidateSet<'_>) -> LayerResult {
    for key in keys {
        let hits = candidates.lookup(key);
        if !hits.is_empty() {
            return LayerResult::from_hits(hits.to_vec());
        }
    }
    LayerResult::NoMatch
}

/// Layer 1: the sidecar is named after the media file.
pub fn match_exact(media_name: &str, candidates: &CandidateSet<'_>) -> LayerResult {
    let name = split_name(media_name);
    keys_layer(&exact_keys(name.stem, name.ext), candidates)
}

/// Layer 2: strip edit markers and counters, then retry the exact keys.
pub fn match_suffix_stripped(media_name: &str, candidates: &CandidateSet<'_>, policy: &MatchPolicy) -> LayerResult {
    let name = split_name(media_name);
    let original = exact_keys(name.stem, name.ext);

    let keys: Vec<String> = stripped_stems(name.stem, &policy.edited_suffixes)
        .into_iter()
        .flat_map(|stem| exact_keys(stem, name.ext))
        .filter(|k| !original.contains(k))
        .collect();

    keys_layer(&dedupe(keys), candidates)
}

/// Layer 3: the media name was cut short; compare against recorded titles.
pub fn match_truncated(media_name: &str, candidates: &CandidateSet<'_>, policy: &MatchPolicy) -> LayerResult {
    let name = split_name(media_name);
    let stem_len = name.stem.chars().count();
    if stem_len == 0 || stem_len < policy.truncated_min_len {
        return LayerResult::NoMatch;
    }

    let hits = candidates
        .iter()
        .filter(|c| {
            let Some(title) = c.title else {
                return false;
            };
            let title = split_name(title);
            title.stem.chars().count() >= stem_len
                && title.stem.chars().take(stem_len).eq(name.stem.chars())
                && extensions_compatible(title.ext, name.ext)
        })
        .map(|c| c.index)
        .collect();

    LayerResult::from_hits(hits)
}

/// Layer 4: unique longest common prefix between media stem and sidecar key,
/// longer than the policy threshold.
pub fn match_fuzzy(media_name: &str, candidates: &CandidateSet<'_>, policy: &MatchPolicy) -> LayerResult {
    let name = split_name(media_name);

    let scored: Vec<(usize, usize)> = candidates
        .iter()
        .map(|c| (c.index, common_prefix_len(name.stem, c.key)))
        .collect();

    let best = scored.iter().map(|(_, len)| *len).max().unwrap_or(0);
    if best <= policy.fuzzy_min_prefix {
        return LayerResult::NoMatch;
    }

    LayerResult::from_hits(
        scored
            .into_iter()
            .filter(|(_, len)| *len == best)
            .map(|(index, _)| index)
            .collect(),
    )
}

/// Match every media file of one directory.
///
/// Exact and suffix layers see all candidates (an edited copy shares the
/// original's sidecar). Sidecars claimed there are withheld from the truncated
/// and fuzzy layers, which then claim in media order.
pub fn match_directory(media_names: &[&str], candidates: &CandidateSet<'_>, policy: &MatchPolicy) -> Vec<SidecarMatch> {
    let mut results: Vec<Option<SidecarMatch>> = vec![None; media_names.len()];
    let mut claimed: HashSet<usize> = HashSet::new();

    for (i, name) in media_names.iter().enumerate() {
        results[i] = settle(match_exact(name, candidates), MatchRule::Exact, &mut claimed);
    }

    for (i, name) in media_names.iter().enumerate() {
        if results[i].is_none() {
            results[i] = settle(match_suffix_stripped(name, candidates, policy), MatchRule::SuffixStripped, &mut claimed);
        }
    }

    for (i, name) in media_names.iter().enumerate() {
        if results[i].is_none() {
            let pool = candidates.without(&claimed);
            results[i] = settle(match_truncated(name, &pool, policy), MatchRule::Truncated, &mut claimed);
        }
    }

    for (i, name) in media_names.iter().enumerate() {
        if results[i].is_none() {
            let pool = candidates.without(&claimed);
            results[i] = settle(match_fuzzy(name, &pool, policy), MatchRule::Fuzzy, &mut claimed);
        }
    }

    results
        .into_iter()
        .map(|r| r.unwrap_or(SidecarMatch::NoCandidate))
        .collect()
}

fn settle(result: LayerResult, rule: MatchRule, claimed: &mut HashSet<usize>) -> Option<SidecarMatch> {
    match result {
        LayerResult::Matched(sidecar) => {
            claimed.insert(sidecar);
            Some(SidecarMatch::Matched { sidecar, rule })
        }
        LayerResult::Ambiguous(candidates) => Some(SidecarMatch::Ambiguous { candidates, rule }),
        LayerResult::NoMatch => None,
    }
}

/// Stems left after removing edit markers and counters, most specific first.
fn stripped_stems<'a>(stem: &'a str, edited_suffixes: &[String]) -> Vec<&'a str> {
    let mut out = Vec::new();

    let edited = strip_edited(stem, edited_suffixes);
    if let Some(e) = edited {
        out.push(e);
    }

    let (base, counter) = split_counter(stem);
    if counter.is_some() {
        out.push(base);
        if let Some(e) = strip_edited(base, edited_suffixes) {
            out.push(e);
        }
    }

    if let Some(e) = edited {
        if let (b, Some(_)) = split_counter(e) {
            out.push(b);
        }
    }

    let mut seen = HashSet::new();
    out.retain(|s| !s.is_empty() && seen.insert(*s));
    out
}

fn strip_edited<'a>(stem: &'a str, edited_suffixes: &[String]) -> Option<&'a str> {
    for suffix in edited_suffixes {
        if stem.len() <= suffix.len() {
            continue;
        }
        let cut = stem.len() - suffix.len();
        if stem.is_char_boundary(cut) && stem[cut..].to_lowercase() == suffix.to_lowercase() {
            return Some(&stem[..cut]);
        }
    }
    None
}

fn extensions_compatible(title_ext: Option<&str>, media_ext: Option<&str>) -> bool {
    match (title_ext, media_ext) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => canonical_ext(a) == canonical_ext(b),
    }
}

fn canonical_ext(ext: &str) -> String {
    match ext.to_lowercase().as_str() {
        "jpeg" => "jpg".to_string(),
        "tif" => "tiff".to_string(),
        "heif" => "heic".to_string(),
        other => other.to_string(),
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

fn dedupe(keys: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::sidecar::SidecarKey;

    struct Fixture {
        keys: Vec<String>,
        titles: Vec<Option<String>>,
    }

    impl Fixture {
        /// (sidecar file name, recorded title)
        fn new(sidecars: &[(&str, Option<&str>)]) -> Self {
            Self {
                keys: sidecars
                    .iter()
                    .map(|(name, _)| SidecarKey::from_file_name(name).unwrap().joined())
                    .collect(),
                titles: sidecars.iter().map(|(_, t)| t.map(str::to_string)).collect(),
            }
        }

        fn set(&self) -> CandidateSet<'_> {
            CandidateSet::new(
                self.keys
                    .iter()
                    .zip(&self.titles)
                    .enumerate()
                    .map(|(index, (key, title))| Candidate {
                        index,
                        key: key.as_str(),
                        title: title.as_deref(),
                    })
                    .collect(),
            )
        }
    }

    fn policy() -> MatchPolicy {
        MatchPolicy::default()
    }

    #[test]
    fn test_exact_full_name_and_stem() {
        let f = Fixture::new(&[("IMG_0001.jpg.json", None), ("IMG_0002.json", None)]);
        let set = f.set();
        assert_eq!(match_exact("IMG_0001.jpg", &set), LayerResult::Matched(0));
        assert_eq!(match_exact("IMG_0002.jpg", &set), LayerResult::Matched(1));
        assert_eq!(match_exact("IMG_0003.jpg", &set), LayerResult::NoMatch);
    }

    #[test]
    fn test_exact_prefers_full_name_over_stem() {
        let f = Fixture::new(&[("IMG.json", None), ("IMG.jpg.json", None)]);
        assert_eq!(match_exact("IMG.jpg", &f.set()), LayerResult::Matched(1));
    }

    #[test]
    fn test_exact_google_counter_form() {
        let f = Fixture::new(&[("IMG_0001.jpg.json", None), ("IMG_0001.jpg(1).json", None)]);
        let set = f.set();
        assert_eq!(match_exact("IMG_0001(1).jpg", &set), LayerResult::Matched(1));
        assert_eq!(match_exact("IMG_0001.jpg", &set), LayerResult::Matched(0));
    }

    #[test]
    fn test_suffix_stripped_edited_shares_original() {
        let f = Fixture::new(&[("IMG_0001.jpg.json", None)]);
        let set = f.set();
        assert_eq!(match_exact("IMG_0001-edited.jpg", &set), LayerResult::NoMatch);
        assert_eq!(match_suffix_stripped("IMG_0001-edited.jpg", &set, &policy()), LayerResult::Matched(0));
        assert_eq!(match_suffix_stripped("IMG_0001-bearbeitet.jpg", &set, &policy()), LayerResult::Matched(0));
        assert_eq!(match_suffix_stripped("IMG_0001(3).jpg", &set, &policy()), LayerResult::Matched(0));
    }

    #[test]
    fn test_truncated_match_from_recorded_title() {
        let f = Fixture::new(&[(
            "IMG_20230101_truncated_at_51_characters_lo.json",
            Some("IMG_20230101_truncated_at_51_characters_long.jpg"),
        )]);
        let result = match_truncated("IMG_20230101_truncated_at_51_char.jpg", &f.set(), &policy());
        assert_eq!(result, LayerResult::Matched(0));
    }

    #[test]
    fn test_truncated_two_candidates_is_ambiguous() {
        let f = Fixture::new(&[
            ("a1.json", Some("IMG_20230101_truncated_at_51_characters_long.jpg")),
            ("a2.json", Some("IMG_20230101_truncated_at_51_characters_other.jpg")),
        ]);
        let result = match_truncated("IMG_20230101_truncated_at_51_char.jpg", &f.set(), &policy());
        assert_eq!(result, LayerResult::Ambiguous(vec![0, 1]));
    }

    #[test]
    fn test_truncated_requires_compatible_extension_and_length() {
        let f = Fixture::new(&[("a.json", Some("IMG_20230101_truncated_at_51_characters_long.mp4"))]);
        assert_eq!(
            match_truncated("IMG_20230101_truncated_at_51_char.jpg", &f.set(), &policy()),
            LayerResult::NoMatch
        );

        let f = Fixture::new(&[("a.json", Some("IMG_0001_long.jpg"))]);
        assert_eq!(match_truncated("IMG.jpg", &f.set(), &policy()), LayerResult::NoMatch);

        let f = Fixture::new(&[("a.json", Some("IMG_20230101_truncated_at_51_characters_long.JPEG"))]);
        assert_eq!(
            match_truncated("IMG_20230101_truncated_at_51_char.jpg", &f.set(), &policy()),
            LayerResult::Matched(0)
        );
    }

    #[test]
    fn test_fuzzy_unique_prefix() {
        let f = Fixture::new(&[
            ("Screenshot_2023-01-01-10-10-10-123_com.exampl.json", None),
            ("Screenshot_2022-05-05.png.json", None),
        ]);
        let result = match_fuzzy("Screenshot_2023-01-01-10-10-10-123_com.example.app.png", &f.set(), &policy());
        assert_eq!(result, LayerResult::Matched(0));
    }

    #[test]
    fn test_fuzzy_tie_and_threshold() {
        let f = Fixture::new(&[
            ("Screenshot_2023-01-01_AAA.json", None),
            ("Screenshot_2023-01-01_BBB.json", None),
        ]);
        assert_eq!(
            match_fuzzy("Screenshot_2023-01-01_CCC.png", &f.set(), &policy()),
            LayerResult::Ambiguous(vec![0, 1])
        );

        let f = Fixture::new(&[("IMG_99.json", None)]);
        assert_eq!(match_fuzzy("IMG_12.jpg", &f.set(), &policy()), LayerResult::NoMatch);

        // a prefix exactly at the threshold is not enough
        let f = Fixture::new(&[("ABCDEFGHIJy.json", None)]);
        assert_eq!(match_fuzzy("ABCDEFGHIJx.jpg", &f.set(), &policy()), LayerResult::NoMatch);
        let f = Fixture::new(&[("ABCDEFGHIJKy.json", None)]);
        assert_eq!(match_fuzzy("ABCDEFGHIJKx.jpg", &f.set(), &policy()), LayerResult::Matched(0));

        let strict = MatchPolicy { fuzzy_min_prefix: 40, ..policy() };
        let f = Fixture::new(&[("Screenshot_2023-01-01_AAA.json", None)]);
        assert_eq!(match_fuzzy("Screenshot_2023-01-01_CCC.png", &f.set(), &strict), LayerResult::NoMatch);
    }

    #[test]
    fn test_directory_layers_in_order() {
        let f = Fixture::new(&[
            ("IMG_0001.jpg.json", Some("IMG_0001.jpg")),
            ("IMG_0001.jpg(1).json", Some("IMG_0001.jpg")),
            ("PXL_20230704_183015123_very_long_camera_name_.json", Some("PXL_20230704_183015123_very_long_camera_name_burst.jpg")),
            ("orphan.jpg.json", Some("orphan.jpg")),
        ]);
        let media = [
            "IMG_0001.jpg",
            "IMG_0001(1).jpg",
            "IMG_0001-edited.jpg",
            "PXL_20230704_183015123_very_long_came.jpg",
            "unrelated.jpg",
        ];
        let results = match_directory(&media, &f.set(), &policy());
        assert_eq!(results[0], SidecarMatch::Matched { sidecar: 0, rule: MatchRule::Exact });
        assert_eq!(results[1], SidecarMatch::Matched { sidecar: 1, rule: MatchRule::Exact });
        assert_eq!(results[2], SidecarMatch::Matched { sidecar: 0, rule: MatchRule::SuffixStripped });
        assert_eq!(results[3], SidecarMatch::Matched { sidecar: 2, rule: MatchRule::Truncated });
        assert_eq!(results[4], SidecarMatch::NoCandidate);
    }

    #[test]
    fn test_claimed_sidecar_not_reused_by_fuzzy() {
        let f = Fixture::new(&[("Holiday_video_2019_final.mp4.json", None)]);
        let media = ["Holiday_video_2019_final.mp4", "Holiday_video_2019_final_cut.mp4"];
        let results = match_directory(&media, &f.set(), &policy());
        assert_eq!(results[0], SidecarMatch::Matched { sidecar: 0, rule: MatchRule::Exact });
        assert_eq!(results[1], SidecarMatch::NoCandidate);
    }

    #[test]
    fn test_ambiguity_is_definitive() {
        let f = Fixture::new(&[
            ("x1.json", Some("IMG_20230101_truncated_at_51_characters_long.jpg")),
            ("x2.json", Some("IMG_20230101_truncated_at_51_characters_other.jpg")),
        ]);
        let results = match_directory(&["IMG_20230101_truncated_at_51_char.jpg"], &f.set(), &policy());
        assert_eq!(
            results[0],
            SidecarMatch::Ambiguous { candidates: vec![0, 1], rule: MatchRule::Truncated }
        );
    }

    #[test]
    fn test_matching_is_deterministic() {
        let f = Fixture::new(&[
            ("Screenshot_2023-01-01_AAA.json", None),
            ("IMG_0001.jpg.json", None),
            ("a1.json", Some("IMG_20230101_truncated_at_51_characters_long.jpg")),
        ]);
        let media = ["IMG_0001.jpg", "Screenshot_2023-01-01_AAA_x.png", "IMG_20230101_truncated_at_51_char.jpg"];
        let first = match_directory(&media, &f.set(), &policy());
        let second = match_directory(&media, &f.set(), &policy());
        assert_eq!(first, second);
    }

    #[test]
    fn test_stripped_stems() {
        let suffixes = policy().edited_suffixes;
        assert_eq!(stripped_stems("IMG-edited", &suffixes), vec!["IMG"]);
        assert_eq!(stripped_stems("IMG(1)", &suffixes), vec!["IMG"]);
        assert_eq!(stripped_stems("IMG(1)-edited", &suffixes), vec!["IMG(1)", "IMG"]);
        assert!(stripped_stems("IMG", &suffixes).is_empty());
    }
}
